
use std::time::Duration;

use harness::{get_request, send_raw, tls_client_connect, HttpBackend, ProxyHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use dockgate_proxy::proxy::load_acceptor;
use dockgate_proxy::{Backend, HostKey, ListenerMode};

fn direct(ip: &str, port: u16) -> Backend {
    Backend::Direct {
        ip: Some(ip.to_string()),
        port,
    }
}

#[tokio::test]
async fn exact_host_request_is_proxied() {
    let backend = HttpBackend::spawn("hello from backend").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    proxy
        .route_table
        .put(HostKey::exact("svc.test"), "", direct("127.0.0.1", backend.addr.port()));

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/"))
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
    assert!(response.contains("hello from backend"));
    assert_eq!(backend.connection_count(), 1);

    // Direct backends see the request untouched.
    let seen = backend.last_request_bytes().await;
    let seen = String::from_utf8_lossy(&seen);
    assert!(seen.contains("\r\nHost: svc.test\r\n"), "got: {seen}");
}

#[tokio::test]
async fn longest_path_prefix_selects_backend() {
    let api = HttpBackend::spawn("api backend").await.unwrap();
    let root = HttpBackend::spawn("root backend").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    proxy
        .route_table
        .put(HostKey::exact("svc.test"), "api", direct("127.0.0.1", api.addr.port()));
    proxy
        .route_table
        .put(HostKey::exact("svc.test"), "", direct("127.0.0.1", root.addr.port()));

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/api/v1/users"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).contains("api backend"));

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/static/app.js"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).contains("root backend"));

    assert_eq!(api.connection_count(), 1);
    assert_eq!(root.connection_count(), 1);
}

#[tokio::test]
async fn wildcard_host_catches_unmatched_hosts() {
    let backend = HttpBackend::spawn("wildcard backend").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    proxy
        .route_table
        .put(HostKey::Wildcard, "", direct("127.0.0.1", backend.addr.port()));

    let response = send_raw(proxy.listen_addr, &get_request("anything.test", "/"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).contains("wildcard backend"));
}

#[tokio::test]
async fn malformed_request_gets_400_without_backend_contact() {
    let backend = HttpBackend::spawn("unused").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    proxy
        .route_table
        .put(HostKey::Wildcard, "", direct("127.0.0.1", backend.addr.port()));

    let response = send_raw(proxy.listen_addr, b"this is not http\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "got: {response}");
    assert!(response.contains("invalid HTTP"));
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unrouted_request_gets_503() {
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    let response = send_raw(proxy.listen_addr, &get_request("unknown.test", "/"))
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"), "got: {response}");
    assert!(response.contains("service unavailable"));
}

#[tokio::test]
async fn unresolvable_backend_gets_503() {
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    // A route whose container never received an address.
    proxy
        .route_table
        .put(HostKey::exact("svc.test"), "", Backend::Direct { ip: None, port: 8080 });

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 503 Service Unavailable"));
}

#[tokio::test]
async fn redirect_listener_sends_301() {
    let backend = HttpBackend::spawn("unused").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::HttpsRedirect).await.unwrap();

    proxy
        .route_table
        .put(HostKey::Wildcard, "", direct("127.0.0.1", backend.addr.port()));

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/admin/login"))
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 301 Moved Permanently"), "got: {response}");
    assert!(response.contains("\r\nLocation: https://svc.test/admin/login\r\n"));
    assert!(response.contains("Redirect to https"));
    // Redirects never touch backends, routed or not.
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn redirect_listener_requires_host_header() {
    let proxy = ProxyHandle::spawn(ListenerMode::HttpsRedirect).await.unwrap();

    let response = send_raw(proxy.listen_addr, b"GET / HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400 Bad Request"));
}

#[tokio::test]
async fn tls_terminating_listener_proxies_decrypted_requests() {
    harness::init_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec!["svc.test".to_string()]).unwrap();
    let cert_der = cert.cert.der().to_vec();

    let cert_dir = std::env::temp_dir().join(format!("dockgate-tls-{}", std::process::id()));
    std::fs::create_dir_all(&cert_dir).unwrap();
    std::fs::write(cert_dir.join("fullchain.pem"), cert.cert.pem()).unwrap();
    std::fs::write(cert_dir.join("privkey.pem"), cert.key_pair.serialize_pem()).unwrap();

    let acceptor = load_acceptor(&cert_dir)
        .unwrap()
        .expect("certificates just written");
    std::fs::remove_dir_all(&cert_dir).ok();

    let backend = HttpBackend::spawn("secure backend").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::TlsTerminating(acceptor))
        .await
        .unwrap();

    proxy
        .route_table
        .put(HostKey::exact("svc.test"), "", direct("127.0.0.1", backend.addr.port()));

    let mut stream = tls_client_connect(proxy.listen_addr, "svc.test", &cert_der)
        .await
        .unwrap();
    stream.write_all(&get_request("svc.test", "/")).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
    assert!(response.contains("secure backend"));
}

#[tokio::test]
async fn route_removal_takes_effect_for_new_connections() {
    let backend = HttpBackend::spawn("transient backend").await.unwrap();
    let proxy = ProxyHandle::spawn(ListenerMode::Plain).await.unwrap();

    let host = HostKey::exact("svc.test");
    proxy
        .route_table
        .put(host.clone(), "", direct("127.0.0.1", backend.addr.port()));

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).contains("transient backend"));

    proxy.route_table.remove(&host, "");

    let response = send_raw(proxy.listen_addr, &get_request("svc.test", "/"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 503 Service Unavailable"));
    assert_eq!(backend.connection_count(), 1);
}
