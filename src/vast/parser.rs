use crate::error::{GatewayError, Result};
use crate::types::{Delivery, MediaFile};
use crate::vast::elements::{self, VastVersion};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Root classification of a parsed VAST document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VastKind {
    /// Terminal creative
    Inline,
    /// Redirect to another VAST tag
    Wrapper,
}

/// Parsed single-ad VAST document.
///
/// Invariants: `vast_ad_tag_uri` is present iff `kind == Wrapper`;
/// `impressions` may be empty for wrappers.
#[derive(Debug, Clone)]
pub struct VastDocument {
    pub version: VastVersion,
    pub kind: VastKind,
    pub ad_id: Option<String>,
    pub ad_system: Option<String>,
    pub ad_title: Option<String>,
    pub advertiser: Option<String>,
    pub impressions: Vec<String>,
    pub error_urls: Vec<String>,
    pub tracking_events: BTreeMap<String, Vec<String>>,
    pub media_files: Vec<MediaFile>,
    pub click_through: Option<String>,
    pub duration_seconds: Option<f32>,
    /// From `<Pricing>` (VAST 3.0+), integer micro-units
    pub price_micros: Option<i64>,
    pub currency: Option<String>,
    pub vast_ad_tag_uri: Option<String>,
    pub raw_xml: String,
}

impl VastDocument {
    pub fn is_wrapper(&self) -> bool {
        self.kind == VastKind::Wrapper
    }
}

/// Version-aware VAST parser.
///
/// A parser configured for version V emits only elements introduced at or
/// before V and not deprecated at V; unknown and forward-compatible
/// elements are skipped without error. In `strict` mode the root version
/// attribute must match the configured version.
#[derive(Debug, Clone)]
pub struct VastParser {
    version: VastVersion,
    strict: bool,
}

impl VastParser {
    pub fn new(version: VastVersion) -> Self {
        Self {
            version,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn parse(&self, xml: &str) -> Result<VastDocument> {
        parse_with(xml, Some(self.version), self.strict)
    }
}

/// Parse with a configured version (convenience for [`VastParser`]).
pub fn parse(xml: &str, version: VastVersion) -> Result<VastDocument> {
    parse_with(xml, Some(version), false)
}

/// Parse filtering at the document's own declared version. The resolver
/// uses this: it accepts any version and filters downstream.
pub fn parse_auto(xml: &str) -> Result<VastDocument> {
    parse_with(xml, None, false)
}

#[derive(Default)]
struct InlineParts {
    ad_system: Option<String>,
    ad_title: Option<String>,
    advertiser: Option<String>,
    impressions: Vec<String>,
    error_urls: Vec<String>,
    tracking_events: BTreeMap<String, Vec<String>>,
    media_files: Vec<MediaFile>,
    click_through: Option<String>,
    duration_seconds: Option<f32>,
    price_micros: Option<i64>,
    currency: Option<String>,
}

#[derive(Default)]
struct WrapperParts {
    ad_tag_uri: String,
    impressions: Vec<String>,
    error_urls: Vec<String>,
    tracking_events: BTreeMap<String, Vec<String>>,
}

fn parse_with(
    xml: &str,
    configured: Option<VastVersion>,
    strict: bool,
) -> Result<VastDocument> {
    let mut reader = Reader::from_str(xml);

    let mut declared_version: Option<String> = None;
    let mut ad_id: Option<String> = None;
    let mut inline: Option<InlineParts> = None;
    let mut wrapper: Option<WrapperParts> = None;
    let mut root_seen = false;
    let mut ad_seen = false;

    // The filter version is fixed before the first Ad: the configured
    // version when present, else the document's declared version.
    let mut filter = configured.unwrap_or(VastVersion::LATEST);

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"VAST" => {
                root_seen = true;
                declared_version = get_attr(e, "version");
                let parsed = declared_version.as_deref().and_then(VastVersion::parse);
                if strict {
                    let expected = configured.unwrap_or(VastVersion::LATEST);
                    if parsed != Some(expected) {
                        return Err(GatewayError::VastVersionMismatch {
                            expected: expected.to_string(),
                            found: declared_version.unwrap_or_else(|| "unknown".to_string()),
                        });
                    }
                }
                if configured.is_none() {
                    filter = parsed.unwrap_or(VastVersion::LATEST);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Ad" => {
                if ad_seen {
                    // Single-ad model: subsequent ads in a pod response are
                    // ignored here; pods go through the parallel resolver.
                    debug!("ignoring additional Ad element");
                    skip_element(&mut reader, "Ad")?;
                    continue;
                }
                ad_seen = true;
                ad_id = get_attr(e, "id").filter(|id| !id.is_empty());
                parse_ad(&mut reader, filter, &mut inline, &mut wrapper)?;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }

    if !root_seen {
        return Err(GatewayError::VastMalformed("no VAST root element".to_string()));
    }

    let version = declared_version
        .as_deref()
        .and_then(VastVersion::parse)
        .unwrap_or(filter);

    match (inline, wrapper) {
        (Some(_), Some(_)) => Err(GatewayError::VastMalformed(
            "Ad contains both InLine and Wrapper".to_string(),
        )),
        (None, None) => Err(GatewayError::VastMalformed(
            "Ad contains neither InLine nor Wrapper".to_string(),
        )),
        (Some(parts), None) => Ok(VastDocument {
            version,
            kind: VastKind::Inline,
            ad_id,
            ad_system: parts.ad_system,
            ad_title: parts.ad_title,
            advertiser: parts.advertiser,
            impressions: parts.impressions,
            error_urls: parts.error_urls,
            tracking_events: parts.tracking_events,
            media_files: parts.media_files,
            click_through: parts.click_through,
            duration_seconds: parts.duration_seconds,
            price_micros: parts.price_micros,
            currency: parts.currency,
            vast_ad_tag_uri: None,
            raw_xml: xml.to_string(),
        }),
        (None, Some(parts)) => {
            if parts.ad_tag_uri.trim().is_empty() {
                return Err(GatewayError::VastMalformed(
                    "Wrapper without VASTAdTagURI".to_string(),
                ));
            }
            Ok(VastDocument {
                version,
                kind: VastKind::Wrapper,
                ad_id,
                ad_system: None,
                ad_title: None,
                advertiser: None,
                impressions: parts.impressions,
                error_urls: parts.error_urls,
                tracking_events: parts.tracking_events,
                media_files: Vec::new(),
                click_through: None,
                duration_seconds: None,
                price_micros: None,
                currency: None,
                vast_ad_tag_uri: Some(parts.ad_tag_uri.trim().to_string()),
                raw_xml: xml.to_string(),
            })
        }
    }
}

/// Parse a single `<Ad>` element into inline and/or wrapper parts.
fn parse_ad(
    reader: &mut Reader<&[u8]>,
    filter: VastVersion,
    inline: &mut Option<InlineParts>,
    wrapper: &mut Option<WrapperParts>,
) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"InLine" => {
                *inline = Some(parse_inline(reader, filter)?);
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Wrapper" => {
                *wrapper = Some(parse_wrapper(reader)?);
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Ad" => return Ok(()),
            Ok(Event::Eof) => return Ok(()),
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in Ad: {e}"
                )));
            }
            _ => {}
        }
    }
}

/// Parse `<InLine>`
fn parse_inline(reader: &mut Reader<&[u8]>, filter: VastVersion) -> Result<InlineParts> {
    let mut parts = InlineParts::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"AdSystem" => {
                parts.ad_system = non_empty(read_text(reader, "AdSystem")?);
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"AdTitle" => {
                parts.ad_title = non_empty(read_text(reader, "AdTitle")?);
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Advertiser" => {
                let text = read_text(reader, "Advertiser")?;
                if elements::visible("Advertiser", filter) {
                    parts.advertiser = non_empty(text);
                } else {
                    debug!(version = %filter, "Advertiser not in this VAST version, skipped");
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Pricing" => {
                let currency = get_attr(e, "currency");
                let text = read_text(reader, "Pricing")?;
                if elements::visible("Pricing", filter) {
                    parts.price_micros = parse_price_micros(&text);
                    parts.currency = currency;
                } else {
                    debug!(version = %filter, "Pricing not in this VAST version, skipped");
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Impression" => {
                let url = read_text(reader, "Impression")?;
                if !url.is_empty() {
                    parts.impressions.push(url);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Error" => {
                let url = read_text(reader, "Error")?;
                if !url.is_empty() {
                    parts.error_urls.push(url);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Creatives" => {
                parse_creatives(reader, &mut parts)?;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"InLine" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in InLine: {e}"
                )));
            }
            _ => {}
        }
    }

    Ok(parts)
}

/// Parse `<Wrapper>`
fn parse_wrapper(reader: &mut Reader<&[u8]>) -> Result<WrapperParts> {
    let mut parts = WrapperParts::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"VASTAdTagURI" => {
                parts.ad_tag_uri = read_text(reader, "VASTAdTagURI")?;
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Impression" => {
                let url = read_text(reader, "Impression")?;
                if !url.is_empty() {
                    parts.impressions.push(url);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Error" => {
                let url = read_text(reader, "Error")?;
                if !url.is_empty() {
                    parts.error_urls.push(url);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"TrackingEvents" => {
                parse_tracking_events(reader, &mut parts.tracking_events)?;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Wrapper" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in Wrapper: {e}"
                )));
            }
            _ => {}
        }
    }

    Ok(parts)
}

/// Parse `<Creatives>`, flattening linear creatives into the document
fn parse_creatives(reader: &mut Reader<&[u8]>, parts: &mut InlineParts) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Linear" => {
                parse_linear(reader, parts)?;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Creatives" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in Creatives: {e}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse `<Linear>`
fn parse_linear(reader: &mut Reader<&[u8]>, parts: &mut InlineParts) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Duration" => {
                let text = read_text(reader, "Duration")?;
                if parts.duration_seconds.is_none() {
                    parts.duration_seconds = parse_duration(&text);
                }
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"MediaFiles" => {
                parse_media_files(reader, &mut parts.media_files)?;
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"TrackingEvents" => {
                parse_tracking_events(reader, &mut parts.tracking_events)?;
            }
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"VideoClicks" => {
                parse_video_clicks(reader, parts)?;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Linear" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in Linear: {e}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse `<MediaFiles>`
fn parse_media_files(reader: &mut Reader<&[u8]>, files: &mut Vec<MediaFile>) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"MediaFile" => {
                let delivery = match get_attr(e, "delivery").as_deref() {
                    Some("progressive") => Some(Delivery::Progressive),
                    Some("streaming") => Some(Delivery::Streaming),
                    _ => None,
                };
                let mime_type = get_attr(e, "type").unwrap_or_default();
                let width = get_attr(e, "width").and_then(|s| s.parse().ok());
                let height = get_attr(e, "height").and_then(|s| s.parse().ok());
                let bitrate_kbps = get_attr(e, "bitrate").and_then(|s| s.parse().ok());
                let codec = get_attr(e, "codec");

                let uri = read_text(reader, "MediaFile")?;
                if uri.is_empty() {
                    warn!("MediaFile without URI, skipped");
                    continue;
                }
                files.push(MediaFile {
                    uri,
                    mime_type,
                    delivery,
                    width,
                    height,
                    bitrate_kbps,
                    codec,
                });
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"MediaFiles" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in MediaFiles: {e}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse `<TrackingEvents>`, merging by event name in insertion order
fn parse_tracking_events(
    reader: &mut Reader<&[u8]>,
    events: &mut BTreeMap<String, Vec<String>>,
) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Tracking" => {
                let event = get_attr(e, "event").unwrap_or_default();
                let url = read_text(reader, "Tracking")?;
                if !event.is_empty() && !url.is_empty() {
                    events.entry(event).or_default().push(url);
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"TrackingEvents" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in TrackingEvents: {e}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse `<VideoClicks>`
fn parse_video_clicks(reader: &mut Reader<&[u8]>, parts: &mut InlineParts) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"ClickThrough" => {
                parts.click_through = non_empty(read_text(reader, "ClickThrough")?);
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"VideoClicks" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "XML parse error in VideoClicks: {e}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Consume events until the matching end tag, tracking nesting.
fn skip_element(reader: &mut Reader<&[u8]>, name: &str) -> Result<()> {
    let name_bytes = name.as_bytes();
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == name_bytes => depth += 1,
            Ok(Event::End(ref e)) if e.name().as_ref() == name_bytes => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Ok(()),
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }
}

/// Parse VAST duration format "HH:MM:SS" or "HH:MM:SS.mmm" to seconds
pub fn parse_duration(duration: &str) -> Option<f32> {
    let parts: Vec<&str> = duration.trim().split(':').collect();
    if parts.len() != 3 {
        warn!("Invalid VAST duration format: {}", duration);
        return None;
    }
    let hours: f32 = parts[0].parse().ok()?;
    let minutes: f32 = parts[1].parse().ok()?;
    let seconds: f32 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// CPM price string → integer micro-units
fn parse_price_micros(text: &str) -> Option<i64> {
    let value: f64 = text.trim().parse().ok()?;
    Some((value * 1_000_000.0).round() as i64)
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

/// Read text content from the current element, handling CDATA
fn read_text(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<String> {
    let mut text = String::new();
    let end_tag_bytes = end_tag.as_bytes();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::CData(e)) => {
                text.push_str(std::str::from_utf8(&e).unwrap_or_default());
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == end_tag_bytes => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!("XML read error: {e}")));
            }
            _ => {}
        }
    }

    Ok(text.trim().to_string())
}

/// Get attribute value from an XML element
fn get_attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| String::from_utf8(a.value.to_vec()).ok())
}
