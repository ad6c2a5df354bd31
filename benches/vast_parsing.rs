//! Benchmarks for VAST XML parsing
//!
//! Parsing happens on every hop of every wrapper chain, so its speed
//! directly bounds resolution latency.

use adgate::vast::{parser, VastVersion};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Generate a VAST InLine response with a configurable media-file ladder
fn generate_vast_inline(media_files: usize) -> String {
    let mut xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.2">
  <Ad id="ad-001">
    <InLine>
      <AdSystem>Benchmark Adserver</AdSystem>
      <AdTitle>Benchmark Ad</AdTitle>
      <Impression><![CDATA[https://tracking.example.com/impression]]></Impression>
      <Creatives>
        <Creative id="creative-001">
          <Linear>
            <Duration>00:00:15</Duration>
            <TrackingEvents>
              <Tracking event="start"><![CDATA[https://tracking.example.com/start]]></Tracking>
              <Tracking event="firstQuartile"><![CDATA[https://tracking.example.com/q1]]></Tracking>
              <Tracking event="midpoint"><![CDATA[https://tracking.example.com/mid]]></Tracking>
              <Tracking event="thirdQuartile"><![CDATA[https://tracking.example.com/q3]]></Tracking>
              <Tracking event="complete"><![CDATA[https://tracking.example.com/complete]]></Tracking>
            </TrackingEvents>
            <MediaFiles>"#
        .to_string();

    let ladder = [
        (640, 360, 800),
        (854, 480, 1400),
        (1280, 720, 2800),
        (1920, 1080, 5000),
    ];
    for idx in 0..media_files {
        let (w, h, br) = ladder[idx % ladder.len()];
        xml.push_str(&format!(
            r#"
              <MediaFile delivery="progressive" type="video/mp4" width="{w}" height="{h}" bitrate="{br}" codec="H.264">
                <![CDATA[https://ads-cdn.example.com/creatives/ad_{w}x{h}.mp4]]>
              </MediaFile>"#
        ));
    }

    xml.push_str(
        r#"
            </MediaFiles>
          </Linear>
        </Creative>
      </Creatives>
    </InLine>
  </Ad>
</VAST>"#,
    );
    xml
}

fn generate_vast_wrapper() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.0">
  <Ad id="wrapper-001">
    <Wrapper>
      <AdSystem>Benchmark Wrapper</AdSystem>
      <VASTAdTagURI><![CDATA[https://ads.example.com/next?cb=[CACHEBUSTING]]]></VASTAdTagURI>
      <Impression><![CDATA[https://tracking.example.com/wrapper-imp]]></Impression>
      <Error><![CDATA[https://tracking.example.com/err?code=[ERRORCODE]]]></Error>
    </Wrapper>
  </Ad>
</VAST>"#
        .to_string()
}

fn bench_parse_inline(c: &mut Criterion) {
    let mut group = c.benchmark_group("vast_parse_inline");
    for media_files in [1usize, 4, 12] {
        let xml = generate_vast_inline(media_files);
        group.bench_with_input(
            BenchmarkId::from_parameter(media_files),
            &xml,
            |b, xml| {
                b.iter(|| parser::parse(black_box(xml), VastVersion::V4_2).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_parse_wrapper(c: &mut Criterion) {
    let xml = generate_vast_wrapper();
    c.bench_function("vast_parse_wrapper", |b| {
        b.iter(|| parser::parse_auto(black_box(&xml)).unwrap());
    });
}

criterion_group!(benches, bench_parse_inline, bench_parse_wrapper);
criterion_main!(benches);
