use crate::session::SessionContext;
use std::collections::BTreeMap;

/// Caller-supplied macro values for one substitution pass, e.g.
/// `ERRORCODE`, `CONTENTPLAYHEAD`, `ASSETURI`.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    pub values: BTreeMap<String, String>,
}

impl MacroContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Context carrying only `[ERRORCODE]`, for error-beacon URLs.
    pub fn error_code(code: u32) -> Self {
        Self::new().with("ERRORCODE", code.to_string())
    }
}

/// Provider producing a macro value from the session and call context.
pub type MacroProvider = fn(&SessionContext, &MacroContext) -> Option<String>;

/// Registry mapping macro names to providers.
///
/// Substitution replaces literal `[NAME]` tokens. Values are
/// percent-encoded; the surrounding URL's own delimiters are untouched.
/// Unknown macros stay intact, which also makes substitution idempotent
/// on strings without known tokens.
pub struct MacroRegistry {
    providers: BTreeMap<String, MacroProvider>,
}

impl Default for MacroRegistry {
    fn default() -> Self {
        let mut registry = Self {
            providers: BTreeMap::new(),
        };
        registry.register("TIMESTAMP", |session, _| {
            Some(session.timestamp_ms.to_string())
        });
        registry.register("CACHEBUSTING", |session, _| {
            Some(session.cachebusting.clone())
        });
        registry.register("CORRELATOR", |session, _| Some(session.correlator.clone()));
        registry.register("ERRORCODE", |_, ctx| ctx.values.get("ERRORCODE").cloned());
        registry
    }
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: MacroProvider) {
        self.providers.insert(name.into(), provider);
    }

    fn resolve(&self, name: &str, session: &SessionContext, ctx: &MacroContext) -> Option<String> {
        if let Some(provider) = self.providers.get(name) {
            if let Some(value) = provider(session, ctx) {
                return Some(value);
            }
        }
        ctx.values.get(name).cloned()
    }

    /// Replace every known `[NAME]` token in `input`.
    pub fn substitute(
        &self,
        input: &str,
        session: &SessionContext,
        ctx: &MacroContext,
    ) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find('[') {
            output.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            match after_open.find(']') {
                Some(close) => {
                    let name = &after_open[..close];
                    if is_macro_name(name) {
                        match self.resolve(name, session, ctx) {
                            Some(value) => output.push_str(&encode_value(&value)),
                            None => {
                                output.push('[');
                                output.push_str(name);
                                output.push(']');
                            }
                        }
                    } else {
                        output.push('[');
                        output.push_str(name);
                        output.push(']');
                    }
                    rest = &after_open[close + 1..];
                }
                None => {
                    output.push('[');
                    rest = after_open;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

/// Macro names are uppercase alphanumerics and underscores.
fn is_macro_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Percent-encode a substituted value for URL safety.
fn encode_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
