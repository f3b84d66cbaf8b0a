use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::{tempdir, TempDir};
use tokio::net::UdpSocket;
use tokio_test::assert_ok;
use winotp_lib::totp::TotpErrorKind;
use winotp_lib::{open_service, start_background_sync, AppConfig};
use wotp_time_ntp::time_ntp::SyncState;

const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;
const SKEW_SECS: f64 = 3600.0;

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

fn put_timestamp(buf: &mut [u8], unix: f64) {
    let ntp = unix + NTP_UNIX_OFFSET;
    let secs = ntp.trunc() as u32;
    let frac = (ntp.fract() * 4_294_967_296.0) as u32;
    buf[..4].copy_from_slice(&secs.to_be_bytes());
    buf[4..8].copy_from_slice(&frac.to_be_bytes());
}

/// SNTP server whose clock runs `SKEW_SECS` ahead of ours.
async fn spawn_skewed_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 48];
        loop {
            let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = [0u8; 48];
            reply[0] = 0x24; // LI 0, VN 4, mode 4
            reply[1] = 1;
            let t = unix_now() + SKEW_SECS;
            put_timestamp(&mut reply[32..40], t);
            put_timestamp(&mut reply[40..48], t);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

fn config_with_server(dir: &TempDir, server: String, timeout_ms: u64) -> AppConfig {
    let mut config = AppConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..AppConfig::default()
    };
    config.ntp.servers = vec![server];
    config.ntp.samples = 1;
    config.ntp.smoothing = false;
    config.ntp.timeout_ms = timeout_ms;
    config
}

#[tokio::test]
async fn test_sync_against_local_server() {
    let addr = spawn_skewed_server().await;
    let dir = tempdir().unwrap();
    let service = open_service(&config_with_server(&dir, addr.to_string(), 1000), false)
        .await
        .unwrap();

    assert_eq!(service.get_ntp_status().state, SyncState::Unsynced);
    assert_ok!(service.sync_ntp().await);

    let status = service.get_ntp_status();
    assert_eq!(status.state, SyncState::Synced);
    let offset = status.offset_ms.unwrap();
    assert!((offset - SKEW_SECS * 1000.0).abs() < 1000.0, "offset {}", offset);
    assert_eq!(status.last_server.as_deref(), Some(addr.to_string().as_str()));
    assert!((service.now() - unix_now() - SKEW_SECS).abs() < 1.0);
}

#[tokio::test]
async fn test_codes_follow_corrected_time() {
    let addr = spawn_skewed_server().await;
    let dir = tempdir().unwrap();
    let service = open_service(&config_with_server(&dir, addr.to_string(), 1000), false)
        .await
        .unwrap();
    let token = service
        .add_token("GitHub", "alice", "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ")
        .await
        .unwrap();

    service.sync_ntp().await.unwrap();
    let code = service.get_code(&token.id).await.unwrap();
    let at = service.now();
    let record = service.registry().get(&token.id).await.unwrap();
    let expected = winotp_lib::totp::core::code_at(&record, at, false).unwrap().code;

    // A window boundary may fall between the two reads.
    if code.time_remaining > 1.0 {
        assert_eq!(code.code, expected);
    }
}

#[tokio::test]
async fn test_unreachable_server_keeps_local_time() {
    // Nothing listens on this socket after it is dropped.
    let addr = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let dir = tempdir().unwrap();
    let service = open_service(&config_with_server(&dir, addr.to_string(), 200), false)
        .await
        .unwrap();

    let err = service.sync_ntp().await.unwrap_err();
    assert!(
        matches!(err.kind, TotpErrorKind::SyncFailure | TotpErrorKind::SyncTimeout),
        "{}",
        err
    );

    let status = service.get_ntp_status();
    assert_ne!(status.state, SyncState::Synced);
    assert!(status.last_error.is_some());
    assert!((service.now() - unix_now()).abs() < 1.0);
}

#[tokio::test]
async fn test_background_sync_uses_configured_interval() {
    let addr = spawn_skewed_server().await;
    let dir = tempdir().unwrap();
    let mut config = config_with_server(&dir, addr.to_string(), 1000);
    config.ntp.sync_interval_secs = 120;
    let service = open_service(&config, false).await.unwrap();

    assert!(start_background_sync(&service, &config));
    // The first round runs straight away.
    for _ in 0..40 {
        if service.get_ntp_status().state == SyncState::Synced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(service.get_ntp_status().state, SyncState::Synced);

    service.stop_periodic_sync();
    assert!(!service.periodic_sync_running());
}

#[tokio::test]
async fn test_background_sync_off_when_ntp_disabled() {
    let dir = tempdir().unwrap();
    let mut config = config_with_server(&dir, "127.0.0.1:9".into(), 200);
    config.ntp.enabled = false;
    let service = open_service(&config, false).await.unwrap();

    assert!(!start_background_sync(&service, &config));
    assert!(!service.periodic_sync_running());
}
