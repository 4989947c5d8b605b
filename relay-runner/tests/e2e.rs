//! End-to-end tests over the whole fabric: an in-process HQ, a real runner
//! agent spawning real PTYs, and a scripted WebSocket client playing the
//! browser.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_hq::Hub;
use relay_protocol::ControlMessage;
use relay_runner::{Agent, AgentConfig};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(15);

async fn start_hq() -> (String, Arc<Hub>) {
    let hub = Arc::new(Hub::new());
    let app = relay_hq::router(hub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), hub)
}

fn start_runner(addr: &str, id: &str) -> Arc<Agent> {
    let agent = Arc::new(Agent::new(AgentConfig {
        hq_url: format!("ws://{addr}/ws/runner"),
        runner_id: id.to_string(),
        token: "dev-token".to_string(),
    }));
    tokio::spawn(agent.clone().run());
    agent
}

async fn wait_for_runner(hub: &Hub, id: &str) {
    timeout(WAIT, async {
        while hub.runner(id).is_none() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("runner never registered");
}

async fn open_session(addr: &str, runner: &str, session_id: &str, command: &[&str]) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/terminal/{runner}"))
        .await
        .unwrap();
    let start = ControlMessage::StartSession {
        session_id: session_id.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
    };
    ws.send(Message::text(start.to_json())).await.unwrap();
    ws
}

async fn expect_session_started(ws: &mut Ws, session_id: &str) {
    let msg = timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for session start ack")
        .expect("socket closed")
        .expect("socket error");
    match msg {
        Message::Text(text) => match ControlMessage::from_json(text.as_str()).unwrap() {
            ControlMessage::SessionStarted { session_id: sid } => assert_eq!(sid, session_id),
            other => panic!("expected session_started, got {other:?}"),
        },
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Collect binary output until `needle` shows up in it.
async fn read_output_until(ws: &mut Ws, needle: &str) -> Vec<u8> {
    let mut output = Vec::new();
    timeout(WAIT, async {
        while !String::from_utf8_lossy(&output).contains(needle) {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => output.extend_from_slice(&data),
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for output: {other:?}"),
            }
        }
    })
    .await
    .expect("expected output never arrived");
    output
}

/// Drain frames until the socket closes, returning any exit report seen.
async fn drain_to_close(ws: &mut Ws) -> Option<i32> {
    let mut exit_code = None;
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ControlMessage::SessionEnded { exit_code: code, .. }) =
                        ControlMessage::from_json(text.as_str())
                    {
                        exit_code = Some(code);
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("socket never closed");
    exit_code
}

#[tokio::test]
async fn echo_session_runs_start_to_finish() {
    let (addr, hub) = start_hq().await;
    let agent = start_runner(&addr, "alpha");
    wait_for_runner(&hub, "alpha").await;
    assert_eq!(hub.list_runners(), vec!["alpha".to_string()]);

    let sid = "11111111-1111-1111-1111-111111111111";
    let mut client = open_session(&addr, "alpha", sid, &["/bin/echo", "hi"]).await;

    expect_session_started(&mut client, sid).await;
    let output = read_output_until(&mut client, "hi").await;
    assert!(String::from_utf8_lossy(&output).contains("hi"));
    assert_eq!(drain_to_close(&mut client).await, Some(0));

    agent.close();
}

#[tokio::test]
async fn cat_session_echoes_input_bytes() {
    let (addr, hub) = start_hq().await;
    let agent = start_runner(&addr, "beta");
    wait_for_runner(&hub, "beta").await;

    let sid = uuid::Uuid::new_v4().to_string();
    let mut client = open_session(&addr, "beta", &sid, &["/bin/cat"]).await;
    expect_session_started(&mut client, &sid).await;

    client.send(Message::binary(b"ABC".to_vec())).await.unwrap();
    let echoed = read_output_until(&mut client, "ABC").await;
    assert!(String::from_utf8_lossy(&echoed).contains("ABC"));

    // Shutting the runner down kills the PTY; the session's exit report (or
    // at least the transport closure) reaches the client.
    agent.close();
    drain_to_close(&mut client).await;
}

#[tokio::test]
async fn runner_shutdown_sweeps_hq_state() {
    let (addr, hub) = start_hq().await;
    let agent = start_runner(&addr, "gamma");
    wait_for_runner(&hub, "gamma").await;

    let sid = uuid::Uuid::new_v4().to_string();
    let mut client = open_session(&addr, "gamma", &sid, &["/bin/cat"]).await;
    expect_session_started(&mut client, &sid).await;

    agent.close();

    drain_to_close(&mut client).await;
    timeout(WAIT, async {
        while !hub.list_runners().is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("runner never swept");
    assert!(hub.runner_for_session(&sid).is_none());
}

#[tokio::test]
async fn runner_retries_until_hq_is_reachable() {
    // Reserve a port, then leave it dark while the agent's first dial fails.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    drop(listener);

    let agent = start_runner(&addr, "delta");
    sleep(Duration::from_millis(300)).await;

    // Bring HQ up on the reserved port; the agent's retry loop should find
    // it and register.
    let hub = Arc::new(Hub::new());
    let app = relay_hq::router(hub.clone());
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    wait_for_runner(&hub, "delta").await;
    agent.close();
}

#[tokio::test]
async fn unknown_runner_is_rejected_before_upgrade() {
    let (addr, _hub) = start_hq().await;

    let err = connect_async(format!("ws://{addr}/ws/terminal/ghost"))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 404),
        other => panic!("expected http rejection, got {other:?}"),
    }
}
