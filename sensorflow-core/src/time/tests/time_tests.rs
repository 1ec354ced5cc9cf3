use super::*;

#[test]
fn test_no_watermark_before_first_event() {
    let strategy = BoundedOutOfOrderness::new(Duration::from_secs(5), |ts: &i64| *ts);
    let wm_gen = strategy.create_watermark_generator();
    assert_eq!(wm_gen.current_watermark(), None);
}

#[test]
fn test_watermark_trails_max_seen_by_delay() {
    let strategy = BoundedOutOfOrderness::new(Duration::from_secs(5), |ts: &i64| *ts);
    let mut wm_gen = strategy.create_watermark_generator();

    wm_gen.on_event(10_000);
    assert_eq!(wm_gen.current_watermark(), Some(Watermark::new(5_000)));

    // A late reading does not move the watermark back.
    wm_gen.on_event(2_000);
    assert_eq!(wm_gen.current_watermark(), Some(Watermark::new(5_000)));

    wm_gen.on_event(20_000);
    assert_eq!(wm_gen.current_watermark(), Some(Watermark::new(15_000)));
}

#[test]
fn test_extract_timestamp_uses_record_field() {
    struct Reading {
        at: i64,
    }
    let strategy = BoundedOutOfOrderness::new(Duration::ZERO, |r: &Reading| r.at);
    assert_eq!(strategy.extract_timestamp(&Reading { at: 1_700 }), 1_700);
}

#[test]
fn test_emitter_reports_only_advances() {
    let strategy = BoundedOutOfOrderness::new(Duration::from_millis(100), |ts: &i64| *ts);
    let mut emitter = WatermarkEmitter::new(strategy.create_watermark_generator());
    assert_eq!(emitter.advance(), None);

    emitter.on_event(1_000);
    assert_eq!(emitter.advance(), Some(Watermark::new(900)));
    assert_eq!(emitter.advance(), None);

    emitter.on_event(950);
    assert_eq!(emitter.advance(), None);

    emitter.on_event(1_500);
    assert_eq!(emitter.advance(), Some(Watermark::new(1_400)));
}

#[test]
fn test_watermark_near_min_does_not_overflow() {
    let strategy = BoundedOutOfOrderness::new(Duration::from_secs(1), |ts: &i64| *ts);
    let mut wm_gen = strategy.create_watermark_generator();
    wm_gen.on_event(i64::MIN + 10);
    assert_eq!(wm_gen.current_watermark(), Some(Watermark::new(i64::MIN)));
}
