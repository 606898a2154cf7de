use std::fs;
use std::net::TcpListener;
use telemetry_pipeline::{clean_stale, DiscoveryRecord};

#[test]
fn test_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let record = DiscoveryRecord::new(12345, 29971, 29972);
    let path = record.write_to(dir.path()).unwrap();

    assert_eq!(path.file_name().unwrap(), "12345.gpd");
    assert_eq!(fs::metadata(&path).unwrap().len(), 12);
    assert_eq!(DiscoveryRecord::read_from(&path).unwrap(), record);
}

#[test]
fn test_oversized_record_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("999.gpd");
    fs::write(&path, [0u8; 16]).unwrap();
    assert!(DiscoveryRecord::read_from(&path).is_err());
}

#[test]
fn test_truncated_record_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("999.gpd");
    fs::write(&path, [0u8; 7]).unwrap();
    assert!(DiscoveryRecord::read_from(&path).is_err());
}

#[test]
fn test_live_record_detected() {
    // A listener on a real port plus our own pid is the live case.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port() as i32;
    let record = DiscoveryRecord::for_current_process(port, 0);
    assert!(record.is_alive());
}

#[test]
fn test_dead_port_is_not_alive() {
    // Bind then drop to get a port nothing is listening on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port() as i32
    };
    let record = DiscoveryRecord::for_current_process(port, 0);
    assert!(!record.is_alive(), "closed port must fail the probe");
}

#[test]
fn test_clean_stale_removes_only_dead_records() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_port = listener.local_addr().unwrap().port() as i32;

    let live = DiscoveryRecord::for_current_process(live_port, 0);
    live.write_to(dir.path()).unwrap();

    // A pid that cannot exist, plus a garbage file, are both stale.
    let dead = DiscoveryRecord::new(i32::MAX - 1, 1, 0);
    dead.write_to(dir.path()).unwrap();
    fs::write(dir.path().join("junk.gpd"), [0xFFu8; 3]).unwrap();
    fs::write(dir.path().join("not-a-record.txt"), b"ignore me").unwrap();

    let removed = clean_stale(dir.path()).unwrap();
    assert_eq!(removed, 2);
    assert!(live.path_in(dir.path()).exists(), "live record survives");
    assert!(
        dir.path().join("not-a-record.txt").exists(),
        "foreign files are untouched"
    );
}
