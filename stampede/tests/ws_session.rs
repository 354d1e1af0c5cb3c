use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use stampede::{
    IterationContext, Run, Scenario,
    executor::SharedIterations,
    protocol::{
        CloseReason, DuplexPlan, DuplexState, Frame, SessionOutcome, WsConnector, run_session,
    },
};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// A one-connection STOMP broker: acknowledges the CONNECT frame and collects
/// every text frame until the client hangs up.
async fn broker() -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws-chatroom", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut frames = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    if text.starts_with("CONNECT\n") {
                        let ack = Frame::new("CONNECTED").header("version", "1.2");
                        ws.send(Message::Text(String::from(ack).into())).await.unwrap();
                    }
                    frames.push(text.as_str().to_owned());
                }
                // Reading on after a Close lets tungstenite answer it
                _ => {}
            }
        }
        frames
    });
    (url, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn stomp_session_over_a_real_websocket() {
    let (url, broker) = broker().await;
    let plan = Arc::new(
        DuplexPlan::builder()
            .url(url)
            .login(Frame::connect("1.2", "10000,10000"))
            .after_ack(vec![
                Frame::subscribe("sub-0", "/topic/chat.rampingtest").into(),
                Frame::send("/app/chat.rampingtest.send")
                    .json(&serde_json::json!({ "content": "hello from member1" }))
                    .unwrap()
                    .into(),
            ])
            .hard_timeout(Duration::from_millis(500))
            .build(),
    );
    let seen: Arc<Mutex<Option<SessionOutcome>>> = Arc::default();

    let outcome = seen.clone();
    let session = move |ctx: IterationContext<()>| {
        let (plan, outcome) = (plan.clone(), outcome.clone());
        async move {
            let result = run_session(&ctx, &WsConnector, &plan).await;
            *outcome.lock().unwrap() = Some(result);
            Ok(())
        }
    };
    let report = Run::builder()
        .scenarios(vec![Scenario::new(
            "chat",
            SharedIterations::builder().vus(1).iterations(1).build(),
            session,
        )])
        .build()
        .execute_with_fixture(())
        .await
        .unwrap();

    let outcome = seen.lock().unwrap().take().unwrap();
    assert!(outcome.connected);
    assert_eq!(outcome.state, DuplexState::Closed);
    assert_eq!(outcome.reached, DuplexState::SubscribedAndSent);
    assert_eq!(outcome.reason, CloseReason::Timeout);
    assert_eq!(outcome.frames_sent, 3);

    let frames = broker.await.unwrap();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].starts_with("CONNECT\naccept-version:1.2\n"));
    assert!(frames[1].starts_with("SUBSCRIBE\nid:sub-0\n"));
    assert!(frames[2].contains("hello from member1"));
    assert!(frames[2].ends_with('\0'));

    assert_eq!(report.metrics.sessions.sessions, 1);
    assert_eq!(report.metrics.sessions.acknowledged, 1);
    assert_eq!(report.metrics.sessions.connect_failed, 0);
}
