//! Chat fan-in over STOMP: each iteration opens a WebSocket, logs in,
//! subscribes to the test topic, sends one message and hangs up after a
//! second, while the arrival rate ramps from 10 to 500 sessions per second.
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use stampede::{
    IterationContext, IterationError, Reporter, Run, Scenario,
    config::parse_duration,
    executor::{RampingArrivalRate, Stage},
    fixture::SetupError,
    protocol::{DuplexPlan, Frame, Http, RequestSpec, WsConnector, run_session},
    report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "BASE_URL", default_value = "http://host.docker.internal:8080")]
    base_url: String,
    #[arg(long, env = "WS_URL", default_value = "ws://host.docker.internal:8080/ws-chatroom")]
    ws_url: String,
    /// How long each session stays open.
    #[arg(long, env = "SESSION_TIMEOUT", default_value = "1s", value_parser = parse_duration)]
    session_timeout: Duration,
    #[arg(long, env = "USERS", default_value_t = 5000)]
    users: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage<'a> {
    chat_room_uuid: &'a str,
    content: String,
    membername: &'a str,
}

type Rooms = Vec<String>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let http = Http::default();
    let rooms_url = format!("{}/api/test/chat/rooms", args.base_url.trim_end_matches('/'));
    let setup = || async {
        let rooms: Rooms = http.fetch_json(RequestSpec::get(&rooms_url)).await?;
        tracing::info!("Loaded {} chat rooms", rooms.len());
        Ok::<_, SetupError>(rooms)
    };

    let ramping = RampingArrivalRate::builder()
        .start_rate(10.0)
        .stages(vec![
            Stage::new(Duration::from_secs(30), 100.0),
            Stage::new(Duration::from_secs(60), 300.0),
            Stage::new(Duration::from_secs(90), 500.0),
        ])
        .pre_allocated_vus(50)
        .max_vus(500)
        .build();

    let (ws_url, timeout, users) = (args.ws_url.clone(), args.session_timeout, args.users);
    let chat = move |mut ctx: IterationContext<Rooms>| {
        let ws_url = ws_url.clone();
        async move {
            let user = ctx.rng.random_range(1..=users);
            let membername = format!("member{user}");
            let n = ctx.fixture().len();
            if n == 0 {
                return Err(IterationError::precondition("no chat rooms"));
            }
            let room = ctx.rng.random_range(0..n);
            let message = ChatMessage {
                chat_room_uuid: &ctx.fixture()[room],
                content: format!("hello from {membername}"),
                membername: &membername,
            };

            let plan = DuplexPlan::builder()
                .url(ws_url)
                .login(Frame::connect("1.2", "10000,10000"))
                .after_ack(vec![
                    Frame::subscribe("sub-0", "/topic/chat.rampingtest").into(),
                    Frame::send("/app/chat.rampingtest.send").json(&message)?.into(),
                ])
                .hard_timeout(timeout)
                .build();
            let outcome = run_session(&ctx, &WsConnector, &plan).await;
            tracing::trace!("Session of {membername} ended: {:?}", outcome.reason);
            Ok(())
        }
    };

    let report = Run::builder()
        .scenarios(vec![Scenario::new("ramping", ramping, chat)])
        .build()
        .execute(setup)
        .await?;

    StdoutReporter.report(&report).await?;
    std::process::exit(report.exit_code());
}
