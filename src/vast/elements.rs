use std::fmt;

/// VAST specification versions understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VastVersion {
    V2_0,
    V3_0,
    V4_0,
    V4_1,
    V4_2,
}

impl VastVersion {
    pub const LATEST: VastVersion = VastVersion::V4_2;

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "2.0" => Some(VastVersion::V2_0),
            "3.0" => Some(VastVersion::V3_0),
            "4.0" => Some(VastVersion::V4_0),
            "4.1" => Some(VastVersion::V4_1),
            "4.2" => Some(VastVersion::V4_2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VastVersion::V2_0 => "2.0",
            VastVersion::V3_0 => "3.0",
            VastVersion::V4_0 => "4.0",
            VastVersion::V4_1 => "4.1",
            VastVersion::V4_2 => "4.2",
        }
    }
}

impl fmt::Display for VastVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version lifetime of one VAST element.
#[derive(Debug, Clone, Copy)]
pub struct ElementSpec {
    pub name: &'static str,
    pub introduced: VastVersion,
    pub deprecated: Option<VastVersion>,
}

/// Elements the gateway consumes or echoes, with the version that
/// introduced them. The parser ignores anything outside this table.
const ELEMENTS: &[ElementSpec] = &[
    spec("VAST", VastVersion::V2_0, None),
    spec("Ad", VastVersion::V2_0, None),
    spec("InLine", VastVersion::V2_0, None),
    spec("Wrapper", VastVersion::V2_0, None),
    spec("VASTAdTagURI", VastVersion::V2_0, None),
    spec("AdSystem", VastVersion::V2_0, None),
    spec("AdTitle", VastVersion::V2_0, None),
    spec("Description", VastVersion::V2_0, None),
    spec("Advertiser", VastVersion::V4_0, None),
    spec("Pricing", VastVersion::V3_0, None),
    spec("Survey", VastVersion::V2_0, Some(VastVersion::V4_1)),
    spec("Error", VastVersion::V2_0, None),
    spec("Impression", VastVersion::V2_0, None),
    spec("ViewableImpression", VastVersion::V4_0, None),
    spec("AdVerifications", VastVersion::V4_1, None),
    spec("Category", VastVersion::V4_0, None),
    spec("Expires", VastVersion::V4_0, None),
    spec("Creatives", VastVersion::V2_0, None),
    spec("Creative", VastVersion::V2_0, None),
    spec("UniversalAdId", VastVersion::V4_0, None),
    spec("Linear", VastVersion::V2_0, None),
    spec("Duration", VastVersion::V2_0, None),
    spec("MediaFiles", VastVersion::V2_0, None),
    spec("MediaFile", VastVersion::V2_0, None),
    spec("Mezzanine", VastVersion::V4_0, None),
    spec("InteractiveCreativeFile", VastVersion::V4_0, None),
    spec("ClosedCaptionFiles", VastVersion::V4_1, None),
    spec("TrackingEvents", VastVersion::V2_0, None),
    spec("Tracking", VastVersion::V2_0, None),
    spec("VideoClicks", VastVersion::V2_0, None),
    spec("ClickThrough", VastVersion::V2_0, None),
    spec("ClickTracking", VastVersion::V2_0, None),
    spec("Extensions", VastVersion::V2_0, None),
];

const fn spec(
    name: &'static str,
    introduced: VastVersion,
    deprecated: Option<VastVersion>,
) -> ElementSpec {
    ElementSpec {
        name,
        introduced,
        deprecated,
    }
}

/// Registry entry for an element name, if known.
pub fn spec_for(name: &str) -> Option<&'static ElementSpec> {
    ELEMENTS.iter().find(|e| e.name == name)
}

/// Whether a parser configured for `version` emits this element: it must
/// be known, introduced at or before `version`, and not yet deprecated.
pub fn visible(name: &str, version: VastVersion) -> bool {
    match spec_for(name) {
        Some(spec) => {
            spec.introduced <= version && spec.deprecated.is_none_or(|dep| version < dep)
        }
        None => false,
    }
}
