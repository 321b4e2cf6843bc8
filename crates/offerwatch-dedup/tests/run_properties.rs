use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use offerwatch_core::{CacheEntry, Fingerprint, ImageRef, RawOffer, SourceKind};
use offerwatch_dedup::{DedupConfig, DiffEngine, MatchedBy, Normalizer, NormalizerConfig, RunError, Verdict};
use offerwatch_storage::{CacheState, CacheStore, FeedName, FetchError, ImageFetcher};
use tempfile::tempdir;

#[derive(Default)]
struct StubFetcher {
    images: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
}

impl StubFetcher {
    fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }

    fn delayed(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus { status: 404, url: url.to_string() })
    }
}

struct NeverFetcher;

#[async_trait]
impl ImageFetcher for NeverFetcher {
    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

/// Panics on any URL containing "poison"; everything else is a 404.
struct PanickingFetcher;

#[async_trait]
impl ImageFetcher for PanickingFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if url.contains("poison") {
            panic!("image decoder crashed on {url}");
        }
        Err(FetchError::HttpStatus { status: 404, url: url.to_string() })
    }
}

fn png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn jpeg(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    buf.into_inner()
}

fn product_photo(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let v = (x * 255 / (width - 1)) as u8;
        let w = (y * 255 / (height - 1)) as u8;
        Rgb([v, w / 3, 200 - v / 2])
    }))
}

/// A 16x16 black/white grid; its average hash is exactly `bit(i)` for cell `i`.
fn bit_grid(flipped: usize) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(16, 16, |x, y| {
        let i = (y * 16 + x) as usize;
        let mut set = (i * 37) % 256 < 128;
        if i < flipped {
            set = !set;
        }
        Luma([if set { 255 } else { 0 }])
    }))
}

fn engine_with(dir: &Path, config: DedupConfig, fetcher: impl ImageFetcher + 'static) -> DiffEngine {
    DiffEngine::new(config, CacheStore::new(dir), Arc::new(fetcher))
}

fn engine(dir: &Path, fetcher: impl ImageFetcher + 'static) -> DiffEngine {
    engine_with(dir, DedupConfig::default(), fetcher)
}

fn feed(name: &str) -> FeedName {
    FeedName::new(name).unwrap()
}

fn offer(source: SourceKind, title: &str, link: &str) -> RawOffer {
    RawOffer::new(source, title, link)
}

#[tokio::test]
async fn second_identical_run_reports_nothing_new() {
    let dir = tempdir().unwrap();
    let fetcher = StubFetcher::default().with("https://img/1.jpg", png(&product_photo(120, 90)));
    let engine = engine(dir.path(), fetcher);
    let offers = vec![
        offer(SourceKind::Lzx, "Rower górski Kross", "https://lzx/1")
            .with_image(ImageRef::Url("https://img/1.jpg".into()))
            .with_price("1 299 zł"),
        offer(SourceKind::Lzx, "Ekspres DeLonghi", "https://lzx/2").with_price("899 zł"),
    ];

    let first = engine.run(offers.clone(), &feed("lzx")).await.unwrap();
    assert_eq!(first.new_offers.len(), 2);

    let second = engine.run(offers, &feed("lzx")).await.unwrap();
    assert!(second.new_offers.is_empty());
    assert_eq!(second.matched(), 2);
    assert_eq!(second.cache.entries, 2);
}

#[tokio::test]
async fn equal_keys_from_two_sources_merge_into_one_entry() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let offers = vec![
        offer(SourceKind::Pepper, "HIT! Słuchawki Sony WH-1000XM5", "https://pepper/1").with_price("999 zł"),
        offer(SourceKind::Lzx, "słuchawki sony wh-1000xm5", "https://lzx/77").with_price("999,00 PLN"),
    ];

    let report = engine.run(offers, &feed("deals")).await.unwrap();
    assert_eq!(report.new_offers.len(), 1);
    assert_eq!(report.new_offers[0].link, "https://pepper/1");
    assert_eq!(report.classifications[1].verdict, Verdict::Matched(MatchedBy::InRun));

    let state = engine.store().load(&feed("deals")).await;
    assert_eq!(state.len(), 1);
    let entry = state.entries().next().unwrap();
    assert!(entry.sources_seen.contains(&SourceKind::Pepper));
    assert!(entry.sources_seen.contains(&SourceKind::Lzx));
}

#[tokio::test]
async fn spammed_listing_yields_one_new_offer() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let offers: Vec<RawOffer> = (0..6)
        .map(|i| offer(SourceKind::Otomoto, "Audi A4 B8 2.0 TDI", &format!("https://otomoto/{i}")).with_price("32 900 zł"))
        .collect();

    let report = engine.run(offers, &feed("otomoto")).await.unwrap();
    assert_eq!(report.new_offers.len(), 1);
    assert_eq!(report.new_offers[0].link, "https://otomoto/0");
    assert_eq!(report.classifications.len(), 6);
    assert_eq!(report.matched(), 5);
}

#[tokio::test]
async fn near_duplicate_images_respect_the_threshold_boundary() {
    let config = DedupConfig { hash_threshold: 10, ..DedupConfig::default() };
    for (flipped, expect_match) in [(9, true), (10, true), (11, false)] {
        let dir = tempdir().unwrap();
        let fetcher = StubFetcher::default()
            .with("https://img/base.png", png(&bit_grid(0)))
            .with("https://img/variant.png", png(&bit_grid(flipped)));
        let engine = engine_with(dir.path(), config.clone(), fetcher);

        let base = offer(SourceKind::Lzx, "iPhone 15 Pro 128GB", "https://lzx/1")
            .with_image(ImageRef::Url("https://img/base.png".into()));
        engine.run(vec![base], &feed("lzx")).await.unwrap();

        let variant = offer(SourceKind::Lzx, "iPhone 15 Pro 128 GB", "https://lzx/2")
            .with_image(ImageRef::Url("https://img/variant.png".into()));
        let report = engine.run(vec![variant], &feed("lzx")).await.unwrap();

        if expect_match {
            assert!(report.new_offers.is_empty(), "distance {flipped} should match");
            assert_eq!(report.classifications[0].verdict, Verdict::Matched(MatchedBy::Perceptual));
        } else {
            assert_eq!(report.new_offers.len(), 1, "distance {flipped} should not match");
        }
    }
}

#[tokio::test]
async fn recompressed_photo_matches_but_unrelated_photo_does_not() {
    let dir = tempdir().unwrap();
    let photo = product_photo(400, 300);
    let fetcher = StubFetcher::default()
        .with("https://img/a.png", png(&photo))
        .with("https://img/a-small.jpg", jpeg(&photo.resize_exact(200, 150, image::imageops::FilterType::Triangle)))
        .with("https://img/other.png", png(&photo.rotate90()));
    let engine = engine(dir.path(), fetcher);

    let offers = vec![
        offer(SourceKind::Pepper, "Lodówka Samsung RB34", "https://pepper/1")
            .with_image(ImageRef::Url("https://img/a.png".into())),
        offer(SourceKind::Lzx, "Lodówka Samsung RB34T", "https://lzx/1")
            .with_image(ImageRef::Url("https://img/a-small.jpg".into())),
        offer(SourceKind::Lzx, "Lodówka Samsung RB38", "https://lzx/2")
            .with_image(ImageRef::Url("https://img/other.png".into())),
    ];
    let report = engine.run(offers, &feed("deals")).await.unwrap();
    let links: Vec<&str> = report.new_offers.iter().map(|o| o.link.as_str()).collect();
    assert_eq!(links, vec!["https://pepper/1", "https://lzx/2"]);
}

#[tokio::test]
async fn conflicting_prices_without_images_stay_separate() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let offers = vec![
        offer(SourceKind::Lzx, "Kawa Lavazza 1kg", "https://lzx/1").with_price("49,99 zł"),
        offer(SourceKind::Lzx, "Kawa Lavazza 1kg", "https://lzx/2").with_price("59,99 zł"),
    ];
    let report = engine.run(offers, &feed("lzx")).await.unwrap();
    assert_eq!(report.new_offers.len(), 2);

    let unknown = vec![offer(SourceKind::Lzx, "Kawa Lavazza 1kg", "https://lzx/3").with_price("zapytaj")];
    let report = engine.run(unknown, &feed("lzx")).await.unwrap();
    assert!(report.new_offers.is_empty());
    assert_eq!(report.cache.entries, 2);
}

#[tokio::test]
async fn offer_matching_two_cached_entries_folds_them_into_the_oldest() {
    let dir = tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    let normalizer = Normalizer::new(&NormalizerConfig::default());
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();

    let mut state = CacheState::empty(feed("deals"));
    for (id, source, link, days) in [
        ("older", SourceKind::Pepper, "https://pepper/4", 0),
        ("younger", SourceKind::Lzx, "https://lzx/4", 5),
    ] {
        let seen = offer(source, "Odkurzacz Dyson V15", link);
        let at = t0 + chrono::Duration::days(days);
        state.insert(CacheEntry {
            id: id.to_string(),
            key: normalizer.normalize(&seen),
            fingerprint: Fingerprint::none(),
            canonical_offer: seen,
            first_seen: at,
            sources_seen: [source].into_iter().collect(),
            last_seen: at,
        });
    }
    store.persist(&state).await.unwrap();

    let engine = engine(dir.path(), StubFetcher::default());
    let report = engine
        .run_at(
            vec![offer(SourceKind::Otomoto, "Odkurzacz Dyson V15", "https://otomoto/4")],
            &feed("deals"),
            t0 + chrono::Duration::days(10),
        )
        .await
        .unwrap();
    assert!(report.new_offers.is_empty());
    assert_eq!(report.classifications[0].entry_id, "older");
    assert_eq!(report.classifications[0].verdict, Verdict::Matched(MatchedBy::ExactKey));

    let merged = engine.store().load(&feed("deals")).await;
    assert_eq!(merged.len(), 1);
    let survivor = merged.get("older").unwrap();
    assert_eq!(survivor.first_seen, t0);
    assert_eq!(survivor.sources_seen.len(), 3);
}

#[tokio::test]
async fn persisted_cache_reloads_equal() {
    let dir = tempdir().unwrap();
    let fetcher = StubFetcher::default().with("https://img/1.png", png(&product_photo(64, 64)));
    let engine = engine(dir.path(), fetcher);
    let offers = vec![
        offer(SourceKind::Pepper, "Konsola PS5", "https://pepper/1")
            .with_image(ImageRef::Url("https://img/1.png".into()))
            .with_price("1 999 zł")
            .with_description("Wersja z napędem"),
        offer(SourceKind::Pepper, "Odkurzacz Dyson V15", "https://pepper/2"),
    ];
    let report = engine.run(offers, &feed("pepper")).await.unwrap();

    let store = CacheStore::new(dir.path());
    let first = store.load(&feed("pepper")).await;
    assert_eq!(first.len(), report.cache.entries);
    store.persist(&first).await.unwrap();
    let second = store.load(&feed("pepper")).await;
    assert_eq!(first, second);

    let console = second
        .entries()
        .find(|e| e.canonical_offer.link == "https://pepper/1")
        .unwrap();
    assert!(console.fingerprint.has_image);
    assert_eq!(console.key.price_cents, Some(199_900));
    assert_eq!(console.canonical_offer.description.as_deref(), Some("Wersja z napędem"));
}

#[tokio::test]
async fn corrupt_cache_starts_over_and_is_replaced() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let path = engine.store().path_for(&feed("lzx"));
    std::fs::write(&path, b"\x1f\x8b definitely not gzip").unwrap();

    let offers = vec![
        offer(SourceKind::Lzx, "Pralka Bosch", "https://lzx/1"),
        offer(SourceKind::Lzx, "Zmywarka Beko", "https://lzx/2"),
    ];
    let report = engine.run(offers.clone(), &feed("lzx")).await.unwrap();
    assert_eq!(report.new_offers.len(), 2);

    let again = engine.run(offers, &feed("lzx")).await.unwrap();
    assert!(again.new_offers.is_empty());
}

#[tokio::test]
async fn entries_outside_retention_are_evicted() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
    let stale = offer(SourceKind::Lzx, "Telewizor LG OLED", "https://lzx/1");
    let fresh = offer(SourceKind::Lzx, "Soundbar Sony", "https://lzx/2");

    engine.run_at(vec![stale.clone()], &feed("lzx"), t0).await.unwrap();
    engine
        .run_at(vec![fresh.clone()], &feed("lzx"), t0 + chrono::Duration::days(60))
        .await
        .unwrap();
    let report = engine
        .run_at(Vec::new(), &feed("lzx"), t0 + chrono::Duration::days(91))
        .await
        .unwrap();
    assert_eq!(report.evicted, 1);

    let state = engine.store().load(&feed("lzx")).await;
    assert_eq!(state.len(), 1);
    assert_eq!(state.entries().next().unwrap().canonical_offer.link, "https://lzx/2");

    let back = engine
        .run_at(vec![stale, fresh], &feed("lzx"), t0 + chrono::Duration::days(92))
        .await
        .unwrap();
    let links: Vec<&str> = back.new_offers.iter().map(|o| o.link.as_str()).collect();
    assert_eq!(links, vec!["https://lzx/1"]);
}

#[tokio::test]
async fn retention_beyond_the_calendar_keeps_everything() {
    let dir = tempdir().unwrap();
    let config = DedupConfig {
        retention: chrono::Duration::try_days(100_000_000),
        ..DedupConfig::default()
    };
    let engine = engine_with(dir.path(), config, StubFetcher::default());
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
    engine
        .run_at(vec![offer(SourceKind::Lzx, "Telewizor LG OLED", "https://lzx/1")], &feed("lzx"), t0)
        .await
        .unwrap();

    let report = engine
        .run_at(Vec::new(), &feed("lzx"), t0 + chrono::Duration::days(400))
        .await
        .unwrap();
    assert_eq!(report.evicted, 0);
    assert_eq!(report.cache.entries, 1);
    assert_eq!(engine.evict(&feed("lzx"), t0).await.unwrap(), 0);
}

#[tokio::test]
async fn explicit_evict_pass_persists_the_shrunk_cache() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), StubFetcher::default());
    let t0 = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
    engine
        .run_at(vec![offer(SourceKind::Pepper, "Kurtka zimowa", "https://pepper/9")], &feed("pepper"), t0)
        .await
        .unwrap();

    let within = engine.evict(&feed("pepper"), t0 + chrono::Duration::days(90)).await.unwrap();
    assert_eq!(within, 0);
    let evicted = engine.evict(&feed("pepper"), t0 + chrono::Duration::days(91)).await.unwrap();
    assert_eq!(evicted, 1);
    assert!(engine.store().load(&feed("pepper")).await.is_empty());
}

#[tokio::test]
async fn imageless_canonical_is_upgraded_by_a_later_sighting() {
    let dir = tempdir().unwrap();
    let fetcher = StubFetcher::default().with("https://img/bike.png", png(&product_photo(80, 80)));
    let engine = engine(dir.path(), fetcher);

    engine
        .run(vec![offer(SourceKind::Lzx, "Rower Kross Hexagon", "https://lzx/1")], &feed("deals"))
        .await
        .unwrap();
    let report = engine
        .run(
            vec![offer(SourceKind::Pepper, "Rower Kross Hexagon", "https://pepper/5")
                .with_image(ImageRef::Url("https://img/bike.png".into()))],
            &feed("deals"),
        )
        .await
        .unwrap();
    assert!(report.new_offers.is_empty());

    let state = engine.store().load(&feed("deals")).await;
    let entry = state.entries().next().unwrap();
    assert_eq!(entry.canonical_offer.link, "https://pepper/5");
    assert!(entry.fingerprint.has_image);
    assert_eq!(entry.sources_seen.len(), 2);
}

#[tokio::test]
async fn placeholder_and_broken_images_do_not_fail_the_run() {
    let dir = tempdir().unwrap();
    let fetcher = StubFetcher::default().with("https://img/broken.jpg", b"<html>502</html>".to_vec());
    let engine = engine(dir.path(), fetcher);
    let offers = vec![
        offer(SourceKind::Lzx, "Fotel biurowy", "https://lzx/1")
            .with_image(ImageRef::Url("https://lzx.pl/static/nophoto.png".into())),
        offer(SourceKind::Lzx, "Biurko narożne", "https://lzx/2")
            .with_image(ImageRef::Url("https://img/broken.jpg".into())),
        offer(SourceKind::Lzx, "Lampka LED", "https://lzx/3")
            .with_image(ImageRef::Url("https://img/missing.jpg".into())),
    ];
    let report = engine.run(offers, &feed("lzx")).await.unwrap();
    assert_eq!(report.new_offers.len(), 3);

    let notified = report.notified();
    assert_eq!(notified[0].name, "Fotel biurowy");
    assert_eq!(notified[0].image.as_deref(), Some("https://lzx.pl/static/nophoto.png"));
}

#[tokio::test]
async fn crashed_fingerprint_task_still_matches_by_key() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), PanickingFetcher);
    engine
        .run(vec![offer(SourceKind::Lzx, "Pralka Bosch Serie 6", "https://lzx/1")], &feed("lzx"))
        .await
        .unwrap();

    let offers = vec![
        offer(SourceKind::Pepper, "Pralka Bosch Serie 6", "https://pepper/1")
            .with_image(ImageRef::Url("https://img/poison-1.jpg".into())),
        offer(SourceKind::Pepper, "Zmywarka Beko", "https://pepper/2")
            .with_image(ImageRef::Url("https://img/poison-2.jpg".into())),
    ];
    let report = engine.run(offers, &feed("lzx")).await.unwrap();
    assert_eq!(report.classifications[0].verdict, Verdict::Matched(MatchedBy::ExactKey));
    assert_eq!(report.classifications[1].verdict, Verdict::New);
    assert_eq!(report.new_offers.len(), 1);
    assert_eq!(report.cache.entries, 2);

    let state = engine.store().load(&feed("lzx")).await;
    assert!(state.entries().all(|e| !e.fingerprint.has_image));
    let washer = state.entries().find(|e| e.canonical_offer.link == "https://pepper/2").unwrap();
    assert_eq!(washer.canonical_offer.image_url(), Some("https://img/poison-2.jpg"));
}

#[tokio::test]
async fn concurrent_fingerprinting_keeps_input_order() {
    let dir = tempdir().unwrap();
    let mut fetcher = StubFetcher::default();
    let mut offers = Vec::new();
    let titles = ["Rower", "Pralka", "Telewizor", "Laptop", "Kamera", "Zegarek"];
    for (i, title) in (0u32..).zip(titles) {
        let url = format!("https://img/{i}.png");
        fetcher = fetcher
            .with(&url, png(&product_photo(60 + i, 60)))
            .delayed(&url, Duration::from_millis(u64::from(60 - i * 10)));
        offers.push(
            offer(SourceKind::Pepper, title, &format!("https://pepper/{i}"))
                .with_image(ImageRef::Url(url))
                .with_price(format!("{} zł", 100 + i)),
        );
    }
    let config = DedupConfig { workers: 3, ..DedupConfig::default() };
    let engine = engine_with(dir.path(), config, fetcher);

    let report = engine.run(offers, &feed("pepper")).await.unwrap();
    let indices: Vec<usize> = report.classifications.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..6).collect::<Vec<_>>());
    let links: Vec<String> = report.new_offers.iter().map(|o| o.link.clone()).collect();
    let expected: Vec<String> = (0..links.len()).map(|i| format!("https://pepper/{i}")).collect();
    assert_eq!(links, expected);
    assert_eq!(links.len(), 6);
}

#[tokio::test]
async fn cancelled_run_leaves_the_cache_untouched() {
    let dir = tempdir().unwrap();
    let feed = feed("lzx");
    engine(dir.path(), StubFetcher::default())
        .run(vec![offer(SourceKind::Lzx, "Pralka Bosch", "https://lzx/1")], &feed)
        .await
        .unwrap();
    let path = CacheStore::new(dir.path()).path_for(&feed);
    let before = std::fs::read(&path).unwrap();

    let stalled = engine(dir.path(), NeverFetcher);
    let offers = vec![
        offer(SourceKind::Lzx, "Suszarka Samsung", "https://lzx/2")
            .with_image(ImageRef::Url("https://img/slow.jpg".into())),
    ];
    let outcome = tokio::time::timeout(Duration::from_millis(50), stalled.run(offers, &feed)).await;
    assert!(outcome.is_err());

    assert_eq!(std::fs::read(&path).unwrap(), before);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn persist_failure_still_returns_new_offers() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();
    let engine = engine(&blocker, StubFetcher::default());

    let err = engine
        .run(vec![offer(SourceKind::Otomoto, "BMW E46 320d", "https://otomoto/1")], &feed("otomoto"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Persist { .. }));
    assert_eq!(err.new_offers().len(), 1);
    assert!(err.to_string().contains("otomoto"));
    assert_eq!(err.into_new_offers()[0].link, "https://otomoto/1");
}
