//! Capability grammar scenarios: round-trip fidelity, best-mode selection
//! and UIBC intersection across the three parameter languages.

use aircast::caps::{
    AudioParameters, H264Level, UibcParameters, VideoMode, VideoParameters,
};

#[test]
fn video_round_trip_is_byte_identical() {
    let corpus = [
        "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none",
        "00 00 01 01 0001ffff 3fffffff 00000fff 00 0000 0000 00 none none, \
         02 02 00000001 00000033 00000044 00 0000 0000 00 none none",
        "00 00 01 01 00001111 00001111 00000111 00 0000 0000 00 none none",
        "00 00 02 02 00001111 00001111 00000111 00 0000 0000 00 none none",
        "00 00 01 01 00012345 12345678 00000123 00 0000 0000 00 none none",
        "00 00 01 01 00000004 00000000 00000000 00 0000 0000 00 none none",
        "30 00 02 02 00000061 00000000 00000000 00 0000 0000 00 none none, \
         01 02 00000061 00000000 00000000 00 0000 0000 00 none none",
        "00 00 01 01 00000000 02000000 00000000 00 0000 0000 00 none none",
    ];
    for line in corpus {
        let params = VideoParameters::parse(line).expect(line);
        assert_eq!(params.generate_video_formats(), line);
    }
}

#[test]
fn audio_round_trip_is_byte_identical() {
    let corpus = [
        "LPCM 00000002 00",
        "LPCM 00000002 00, AAC 00000003 00, AC3 00000007 00",
        "AAC 00000002 00",
        "LPCM 00000003 00, AAC 0000000f 00, AC3 00000007 00",
    ];
    for line in corpus {
        let params = AudioParameters::parse(line).expect(line);
        assert_eq!(params.generate_audio_formats(), line);
    }
}

#[test]
fn uibc_round_trip_is_byte_identical() {
    let corpus = [
        "none",
        "input_category_list=none; generic_cap_list=none; hidc_cap_list=none; port=none",
        "input_category_list=GENERIC, HIDC; generic_cap_list=Mouse, Keyboard, SingleTouch, Camera; \
         hidc_cap_list=Mouse/USB, RemoteControl/No-SP; port=none",
        "input_category_list=GENERIC, HIDC; generic_cap_list=Keyboard, Mouse, SingleTouch; \
         hidc_cap_list=Mouse/USB, RemoteControl/No-SP; port=1512",
    ];
    for line in corpus {
        let params = UibcParameters::parse(line).expect(line);
        assert_eq!(params.generate_uibc_capability(), line);
    }
}

#[test]
fn best_mode_selection_floors_profile_and_level() {
    // Source offers CBP and CHP at level 4.2 with the full CEA mask; the
    // sink only does CBP 3.1 at 640x480p60.
    let source = VideoParameters::parse(
        "00 00 01 10 0001ffff 00000000 00000000 00 0000 0000 00 none none, \
         02 10 0001ffff 00000000 00000000 00 0000 0000 00 none none",
    )
    .unwrap();
    let sink = VideoParameters::parse(
        "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none",
    )
    .unwrap();

    let best = source.get_best_video_mode(&sink, None).unwrap();
    assert!(!best.high_profile);
    assert_eq!(best.level, H264Level::L31);
    assert_eq!((best.width, best.height, best.frame_rate), (640, 480, 60));
    assert!(best.progressive);
}

#[test]
fn desired_mode_wins_when_matching() {
    let source = VideoParameters::parse(
        "00 00 01 10 0001ffff 00000000 00000000 00 0000 0000 00 none none",
    )
    .unwrap();
    let sink = source.clone();

    let desired = VideoMode {
        high_profile: false,
        level: H264Level::L31,
        width: 1280,
        height: 720,
        frame_rate: 25,
        progressive: true,
    };
    let best = source.get_best_video_mode(&sink, Some(&desired)).unwrap();
    assert_eq!(best, desired);

    // A desired mode outside the matching set falls back to dominance.
    let impossible = VideoMode {
        width: 4096,
        height: 2160,
        ..desired
    };
    let best = source.get_best_video_mode(&sink, Some(&impossible)).unwrap();
    assert_eq!((best.width, best.height, best.frame_rate), (1920, 1080, 60));
}

#[test]
fn uibc_intersection_preserves_source_port() {
    let sink = UibcParameters::parse(
        "input_category_list=GENERIC, HIDC; \
         generic_cap_list=Mouse, Keyboard, SingleTouch, Camera; \
         hidc_cap_list=Mouse/USB, RemoteControl/No-SP; port=none",
    )
    .unwrap();
    let source = UibcParameters::parse(
        "input_category_list=GENERIC, HIDC; \
         generic_cap_list=Mouse, Keyboard, SingleTouch, MultiTouch; \
         hidc_cap_list=Mouse/BT, Keyboard/Wi-Fi, RemoteControl/No-SP; port=1512",
    )
    .unwrap();

    let selected = source.select_uibc_params(&sink).unwrap();
    assert_eq!(
        selected.generate_uibc_capability(),
        "input_category_list=GENERIC, HIDC; \
         generic_cap_list=Keyboard, Mouse, SingleTouch; \
         hidc_cap_list=Mouse/USB, RemoteControl/No-SP; port=1512"
    );
}

#[test]
fn apply_cycle_agrees_with_generation() {
    // What one side generates as its chosen mode, the other side accepts.
    let sink = VideoParameters::parse(
        "00 00 01 01 0001ffff 00000000 00000000 00 0000 0000 00 none none",
    )
    .unwrap();
    let source = VideoParameters::parse(
        "00 00 01 10 0001ffff 00000000 00000000 00 0000 0000 00 none none",
    )
    .unwrap();

    let best = source.get_best_video_mode(&sink, None).unwrap();
    let line = VideoParameters::generate_video_mode(&best).unwrap();
    let applied = sink.apply_video_mode(&line).unwrap().unwrap();
    assert_eq!(applied, best);
}
