use crate::error::Result;
use crate::session::SessionContext;
use crate::upstream::codec;
use crate::upstream::{ParamValue, Upstream, UpstreamRequest};
use crate::vast::macros::{MacroContext, MacroRegistry};
use crate::vast::parser::{VastDocument, VastParser};
use crate::vast::VastVersion;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// VAST protocol surface over an upstream: typed request plus parse.
///
/// Applies macro substitution to parameter values before dispatch (when
/// enabled) and decodes the response charset-aware. Wrapper recursion is
/// not this layer's job; see the chain resolver.
pub struct VastProtocol {
    upstream: Arc<dyn Upstream>,
    registry: MacroRegistry,
    parser: VastParser,
    expand_macros: bool,
    charset: Option<String>,
}

impl VastProtocol {
    pub fn new(upstream: Arc<dyn Upstream>, version: VastVersion) -> Self {
        Self {
            upstream,
            registry: MacroRegistry::new(),
            parser: VastParser::new(version),
            expand_macros: true,
            charset: None,
        }
    }

    pub fn with_registry(mut self, registry: MacroRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn without_macro_expansion(mut self) -> Self {
        self.expand_macros = false;
        self
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn registry(&self) -> &MacroRegistry {
        &self.registry
    }

    /// Dispatch a request and return the raw VAST XML.
    pub async fn request(
        &self,
        params: Vec<(String, ParamValue)>,
        ctx: &SessionContext,
        cancel: CancellationToken,
    ) -> Result<String> {
        let params = if self.expand_macros {
            let macro_ctx = MacroContext::new();
            params
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        ParamValue::Single(v) => {
                            ParamValue::Single(self.registry.substitute(&v, ctx, &macro_ctx))
                        }
                        ParamValue::Many(vs) => ParamValue::Many(
                            vs.into_iter()
                                .map(|v| self.registry.substitute(&v, ctx, &macro_ctx))
                                .collect(),
                        ),
                    };
                    (key, value)
                })
                .collect()
        } else {
            params
        };

        let mut req = UpstreamRequest::new()
            .context(ctx.clone())
            .cancellation(cancel);
        req.params = params;

        debug!(upstream = self.upstream.key(), "VAST protocol request");
        let body = self.upstream.request(req).await?;
        codec::decode_text(&body, self.charset.as_deref())
    }

    /// Parse raw XML at this protocol's configured version.
    pub fn parse(&self, xml: &str) -> Result<VastDocument> {
        self.parser.parse(xml)
    }
}
