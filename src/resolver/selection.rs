use crate::types::MediaFile;
use std::sync::Arc;

/// Creative selection strategy applied to the final inline document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    HighestBitrate,
    LowestBitrate,
    /// Bandwidth heuristic: highest bitrate when the best option is at
    /// least 1000 kbps, lowest otherwise
    BestQuality,
    /// Delegate to a caller-provided selector
    Custom,
}

/// Caller-provided selector for [`SelectionStrategy::Custom`].
pub type CustomSelector = Arc<dyn Fn(&[MediaFile]) -> Option<MediaFile> + Send + Sync>;

const BEST_QUALITY_PIVOT_KBPS: u32 = 1000;

/// Select a media file from the final document's creatives.
///
/// Entries without a bitrate are ignored when any entry has one; when
/// none do, the first entry wins. An empty list selects nothing and never
/// errors. Bitrate ties break on resolution, then insertion order.
pub fn select_media(
    files: &[MediaFile],
    strategy: SelectionStrategy,
    custom: Option<&CustomSelector>,
) -> Option<MediaFile> {
    if files.is_empty() {
        return None;
    }
    match strategy {
        SelectionStrategy::Custom => custom.and_then(|selector| selector(files)),
        SelectionStrategy::HighestBitrate => pick(files, true),
        SelectionStrategy::LowestBitrate => pick(files, false),
        SelectionStrategy::BestQuality => {
            let max_bitrate = files.iter().filter_map(|f| f.bitrate_kbps).max();
            match max_bitrate {
                Some(max) if max >= BEST_QUALITY_PIVOT_KBPS => pick(files, true),
                Some(_) => pick(files, false),
                None => files.first().cloned(),
            }
        }
    }
}

fn pick(files: &[MediaFile], highest: bool) -> Option<MediaFile> {
    let mut candidates = files.iter().filter(|f| f.bitrate_kbps.is_some());
    let first = match candidates.next() {
        Some(first) => first,
        // No entry carries a bitrate: insertion order decides
        None => return files.first().cloned(),
    };

    let mut best = first;
    for candidate in candidates {
        let (b, c) = (best.bitrate_kbps, candidate.bitrate_kbps);
        let better = if highest {
            c > b || (c == b && candidate.resolution() > best.resolution())
        } else {
            c < b || (c == b && candidate.resolution() < best.resolution())
        };
        // Strict comparisons keep the earlier entry on full ties
        if better {
            best = candidate;
        }
    }
    Some(best.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Delivery;

    fn media(uri: &str, bitrate: Option<u32>, width: u32, height: u32) -> MediaFile {
        MediaFile {
            uri: uri.to_string(),
            mime_type: "video/mp4".to_string(),
            delivery: Some(Delivery::Progressive),
            width: Some(width),
            height: Some(height),
            bitrate_kbps: bitrate,
            codec: None,
        }
    }

    #[test]
    fn test_empty_list_selects_none() {
        for strategy in [
            SelectionStrategy::HighestBitrate,
            SelectionStrategy::LowestBitrate,
            SelectionStrategy::BestQuality,
        ] {
            assert!(select_media(&[], strategy, None).is_none());
        }
    }

    #[test]
    fn test_highest_bitrate() {
        let files = vec![
            media("a", Some(800), 640, 360),
            media("b", Some(2500), 1920, 1080),
            media("c", Some(1500), 1280, 720),
        ];
        let selected = select_media(&files, SelectionStrategy::HighestBitrate, None).unwrap();
        assert_eq!(selected.uri, "b");
    }

    #[test]
    fn test_lowest_bitrate() {
        let files = vec![
            media("a", Some(800), 640, 360),
            media("b", Some(2500), 1920, 1080),
        ];
        let selected = select_media(&files, SelectionStrategy::LowestBitrate, None).unwrap();
        assert_eq!(selected.uri, "a");
    }

    #[test]
    fn test_bitrate_tie_breaks_on_resolution_then_order() {
        let files = vec![
            media("low-res", Some(1500), 640, 360),
            media("hi-res", Some(1500), 1920, 1080),
            media("hi-res-later", Some(1500), 1920, 1080),
        ];
        let selected = select_media(&files, SelectionStrategy::HighestBitrate, None).unwrap();
        assert_eq!(selected.uri, "hi-res");
    }

    #[test]
    fn test_entries_without_bitrate_ignored_when_any_has_one() {
        let files = vec![
            media("no-bitrate", None, 3840, 2160),
            media("with-bitrate", Some(400), 640, 360),
        ];
        let selected = select_media(&files, SelectionStrategy::HighestBitrate, None).unwrap();
        assert_eq!(selected.uri, "with-bitrate");
    }

    #[test]
    fn test_no_bitrates_first_wins() {
        let files = vec![media("first", None, 0, 0), media("second", None, 0, 0)];
        for strategy in [
            SelectionStrategy::HighestBitrate,
            SelectionStrategy::LowestBitrate,
            SelectionStrategy::BestQuality,
        ] {
            let selected = select_media(&files, strategy, None).unwrap();
            assert_eq!(selected.uri, "first");
        }
    }

    #[test]
    fn test_best_quality_pivots_on_1000_kbps() {
        let fast = vec![media("a", Some(600), 640, 360), media("b", Some(2000), 1920, 1080)];
        let selected = select_media(&fast, SelectionStrategy::BestQuality, None).unwrap();
        assert_eq!(selected.uri, "b");

        let slow = vec![media("a", Some(300), 640, 360), media("b", Some(900), 1280, 720)];
        let selected = select_media(&slow, SelectionStrategy::BestQuality, None).unwrap();
        assert_eq!(selected.uri, "a");
    }

    #[test]
    fn test_custom_selector() {
        let files = vec![media("a", Some(800), 640, 360), media("b", Some(100), 0, 0)];
        let selector: CustomSelector =
            Arc::new(|files| files.iter().find(|f| f.uri == "b").cloned());
        let selected =
            select_media(&files, SelectionStrategy::Custom, Some(&selector)).unwrap();
        assert_eq!(selected.uri, "b");

        let none_selector: CustomSelector = Arc::new(|_| None);
        assert!(select_media(&files, SelectionStrategy::Custom, Some(&none_selector)).is_none());
    }
}
