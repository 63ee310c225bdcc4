//! End-to-end tests over HTTP and WebSocket against the packaged analysis.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use dashbench_host::adapter::AdapterRegistry;
use dashbench_host::analysis::{AnalysisDescriptor, AnalysisIndex, AnalysisRegistry, KernelKind};
use dashbench_host::bus::MessageBus;
use dashbench_host::hub::Hub;
use dashbench_host::infrastructure::server::{build_router, AppState, IndexPage};
use dashbench_host::kernel::StatusBoard;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Serves dummypi in-process plus a hidden external analysis with no kernel.
async fn serve() -> Result<SocketAddr> {
    let analyses = AnalysisRegistry::packaged();
    let index = AnalysisIndex {
        title: Some("Test dashboard".into()),
        analyses: vec![
            AnalysisDescriptor::new("dummypi", KernelKind::None),
            AnalysisDescriptor::new("offline", KernelKind::Python),
        ],
        ..AnalysisIndex::default()
    };

    let bus = MessageBus::bind(0).await?;
    let adapters = AdapterRegistry::from_descriptors(&index.analyses, &analyses, &bus.publisher());
    let (hub, _task) = Hub::new(adapters).spawn(None);
    let state = AppState::new(hub, IndexPage::from_index(&index), StatusBoard::default(), None);
    let app = build_router(state, analyses.all_routes());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _bus = bus;
        axum::serve(listener, app).await
    });
    Ok(addr)
}

async fn http_get(addr: SocketAddr, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status = response
        .split_whitespace()
        .nth(1)
        .context("no status line")?
        .parse()?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

async fn next_json<S>(socket: &mut S) -> Result<Value>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .context("timed out waiting for frame")?
            .context("socket closed")??;
        if let Message::Text(text) = message {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

#[tokio::test]
async fn browser_session_runs_dummypi() -> Result<()> {
    let addr = serve().await?;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/dummypi/ws")).await?;

    socket
        .send(Message::Text(
            json!({"__connect": null, "__request_args": "?samples=200"}).to_string().into(),
        ))
        .await?;
    let hello = next_json(&mut socket).await?;
    assert_eq!(hello["signal"], "__connect");
    assert!(hello["load"]["analysis_id"].as_str().is_some_and(|id| !id.is_empty()));

    socket
        .send(Message::Text(json!({"signal": "samples", "load": 200}).to_string().into()))
        .await?;
    socket
        .send(Message::Text(json!({"signal": "run"}).to_string().into()))
        .await?;

    let mut statuses = 0;
    loop {
        let frame = next_json(&mut socket).await?;
        match frame["signal"].as_str() {
            Some("status") => statuses += 1,
            Some("log") if frame["load"] == json!({"action": "done"}) => break,
            _ => {}
        }
    }
    assert_eq!(statuses, 2);
    Ok(())
}

#[tokio::test]
async fn signals_before_connect_are_ignored() -> Result<()> {
    let addr = serve().await?;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/dummypi/ws")).await?;

    socket
        .send(Message::Text(json!({"signal": "run"}).to_string().into()))
        .await?;
    socket
        .send(Message::Text(json!({"__connect": "resume-me"}).to_string().into()))
        .await?;

    let hello = next_json(&mut socket).await?;
    assert_eq!(hello["signal"], "__connect");
    assert_eq!(hello["load"]["analysis_id"], "resume-me");
    Ok(())
}

#[tokio::test]
async fn unavailable_analysis_refuses_the_session() -> Result<()> {
    let addr = serve().await?;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/offline/ws")).await?;

    socket
        .send(Message::Text(json!({"__connect": null}).to_string().into()))
        .await?;
    let refusal = next_json(&mut socket).await?;
    assert_eq!(refusal["signal"], "__error");
    Ok(())
}

#[tokio::test]
async fn unknown_analysis_is_not_upgraded() -> Result<()> {
    let addr = serve().await?;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/nosuch/ws")).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn index_lists_analyses_with_availability() -> Result<()> {
    let addr = serve().await?;
    let (status, body) = http_get(addr, "/").await?;
    assert_eq!(status, 200);

    let index: Value = serde_json::from_str(&body)?;
    assert_eq!(index["title"], "Test dashboard");
    let analyses = index["analyses"].as_array().context("analyses array")?;
    let dummypi = analyses
        .iter()
        .find(|a| a["name"] == "dummypi")
        .context("dummypi listed")?;
    assert_eq!(dummypi["available"], true);
    assert_eq!(dummypi["kernel"], "none");
    let offline = analyses
        .iter()
        .find(|a| a["name"] == "offline")
        .context("offline listed")?;
    assert_eq!(offline["available"], false);
    Ok(())
}

#[tokio::test]
async fn health_and_extra_routes_are_served() -> Result<()> {
    let addr = serve().await?;
    assert_eq!(http_get(addr, "/health/live").await?, (200, "OK".to_string()));
    assert_eq!(http_get(addr, "/health/ready").await?.0, 200);
    assert_eq!(http_get(addr, "/metrics").await?.0, 404);

    let (status, body) = http_get(addr, "/dummypi/about").await?;
    assert_eq!(status, 200);
    let about: Value = serde_json::from_str(&body)?;
    assert_eq!(about["sequence"], "halton");
    Ok(())
}
