use super::*;

#[test]
fn test_memory_resources_not_found() {
    let resources = MemoryResources::new();
    assert!(matches!(
        resources.load("butterfly_720_2000.h264"),
        Err(Error::ErrNotFound(_))
    ));
}

#[test]
fn test_synthetic_resources_cover_catalog() {
    let resources = MemoryResources::synthetic();
    for spec in video_catalog() {
        let data = resources.load(&spec.resource_name()).unwrap();
        // roughly one second of media at the target bitrate
        let expected = spec.kbps as usize * 1000 / 8;
        assert!(
            data.len() >= expected * 9 / 10,
            "{} is {} bytes",
            spec.resource_name(),
            data.len()
        );
    }
    assert!(resources.load(AUDIO_RESOURCE).is_ok());
}

#[test]
fn test_dir_resources() {
    let dir = std::env::temp_dir().join(format!("rtc-loadtest-resources-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("speech.ogg"), b"OggS").unwrap();

    let resources = DirResources::new(&dir);
    assert_eq!(&resources.load("speech.ogg").unwrap()[..], b"OggS");
    assert!(matches!(
        resources.load("missing.ivf"),
        Err(Error::ErrNotFound(_))
    ));

    std::fs::remove_dir_all(&dir).unwrap();
}
