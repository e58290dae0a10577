//! Integration test: start the gateway on a free port, GET / and /status, assert the JSON.
//! Does not require Ollama or Telegram. The server task is aborted when the test ends.

use duet::config::Config;
use duet::gateway;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn get_json(client: &reqwest::Client, url: &str) -> Option<serde_json::Value> {
    for _ in 0..100 {
        if let Ok(resp) = client.get(url).send().await {
            if resp.status().is_success() {
                return Some(resp.json().await.expect("parse JSON"));
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::test]
async fn gateway_health_and_status_respond() {
    let port = free_port();
    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let client = reqwest::Client::new();
    let health_url = format!("http://127.0.0.1:{}/", port);
    let Some(health) = get_json(&client, &health_url).await else {
        gateway_handle.abort();
        panic!("GET {} did not return 200 with health JSON within 5s", health_url);
    };
    assert_eq!(health.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(health.get("protocol").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(health.get("port").and_then(|v| v.as_u64()), Some(port as u64));

    let status = get_json(&client, &format!("http://127.0.0.1:{}/status", port))
        .await
        .expect("status JSON");
    assert_eq!(status["channels"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(status["clients"].as_array().map(|a| a.len()), Some(0));

    gateway_handle.abort();
}

#[tokio::test]
async fn webhook_rejects_wrong_secret_and_accepts_updates() {
    let port = free_port();
    let mut config = Config::default();
    config.gateway.port = port;
    config.channels.telegram.webhook_secret = Some("s3cret".to_string());

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let client = reqwest::Client::new();
    get_json(&client, &format!("http://127.0.0.1:{}/", port))
        .await
        .expect("gateway up");

    let url = format!("http://127.0.0.1:{}/telegram/webhook", port);
    let update = serde_json::json!({
        "update_id": 1,
        "message": { "chat": { "id": 42 }, "from": { "id": 7, "username": "ana" }, "text": "hello" }
    });
    let denied = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", "wrong")
        .json(&update)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(denied.status(), reqwest::StatusCode::FORBIDDEN);

    let accepted = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", "s3cret")
        .json(&update)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(accepted.status(), reqwest::StatusCode::OK);

    let malformed = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", "s3cret")
        .body("not json")
        .send()
        .await
        .expect("post webhook");
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    gateway_handle.abort();
}
