//! Vocabulary book workloads: read paths at fixed rates and the batch
//! endpoints that replay analysis windows and build daily books.
//!
//! ```text
//! cargo run --example voca -- reads
//! cargo run --example voca -- daily --date 2025-08-21
//! ```
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::{Parser, Subcommand};
use stampede::{
    IterationContext, Reporter, Run, Scenario, ThresholdRule,
    executor::{ConstantArrivalRate, PerVuIterations, RampingVus, SharedIterations, Stage},
    protocol::{Http, RequestSpec},
    report::{RunReport, StdoutReporter},
};
use tracing_subscriber::EnvFilter;

/// Failed replays logged in full before going quiet.
const LOG_LIMIT: usize = 5;

#[derive(Parser)]
#[command(about = "Vocabulary book load tests")]
struct Cli {
    #[arg(long, env = "BASE_URL", default_value = "http://host.docker.internal:8080", global = true)]
    base_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// All words, words by date and words by level, 100 rps each
    Reads {
        #[arg(long, env = "MEMBER", default_value = "user1")]
        member: String,
        #[arg(long, env = "DATE", default_value = "2025-08-14")]
        date: String,
        #[arg(long, env = "LEVEL", default_value = "a1")]
        level: String,
    },
    /// Twenty overlapping replays of the same window
    Overlap {
        #[arg(long, env = "FROM", default_value = "2025-08-18T05:00:00Z")]
        from: String,
        #[arg(long, env = "TO", default_value = "2025-08-18T06:00:00Z")]
        to: String,
    },
    /// The hourly replay job under a ramp up to 100 VUs
    Hourly {
        #[arg(long, default_value = "2025-08-20T07:00:00Z")]
        from: String,
        #[arg(long, default_value = "2025-08-20T08:00:00Z")]
        to: String,
    },
    /// One daily book per user, 200 users at once
    Daily {
        #[arg(long, env = "DATE", default_value = "2025-08-21")]
        date: String,
        /// Id of the user driven by VU 1.
        #[arg(long, default_value_t = 4622)]
        start_id: u64,
    },
}

fn replay(base: &str, from: &str, to: &str) -> RequestSpec {
    RequestSpec::post(format!("{base}/api/test/voca/replay"))
        .query("from", from)
        .query("to", to)
        .header("Content-Type", "application/json")
        .tag("type", "replay")
}

async fn reads(
    http: Http,
    base: String,
    member: String,
    date: String,
    level: String,
) -> stampede::Result<RunReport> {
    let steady = || {
        ConstantArrivalRate::builder()
            .rate(100.0)
            .duration(Duration::from_secs(60))
            .pre_allocated_vus(50)
            .max_vus(200)
            .build()
    };
    let books = format!("{base}/api/vocabook/member/{member}");
    let get = move |url: String, kind: &'static str| {
        let http = http.clone();
        move |ctx: IterationContext<()>| {
            let (http, url) = (http.clone(), url.clone());
            async move {
                let spec = RequestSpec::get(url).query("page", 0).query("size", 50);
                let spec = match kind {
                    "date" => spec.query("sortBy", "analyzedAt").query("direction", "desc"),
                    _ => spec,
                };
                let res = http.request(&ctx, spec.tag("type", kind)).await;
                tracing::debug!("{kind}: {}", res.summary());
                ctx.check("status 200", res.status == 200);
                Ok(())
            }
        }
    };

    Run::builder()
        .scenarios(vec![
            Scenario::new("all_words", steady(), get(books.clone(), "all")),
            Scenario::new("date_words", steady(), get(format!("{books}/{date}"), "date")),
            Scenario::new("level_words", steady(), get(format!("{books}/level/{level}"), "level")),
        ])
        .thresholds(vec![
            ThresholdRule::parse("http_req_duration", "p(95)<1000")?,
            ThresholdRule::parse("http_req_failed", "rate<0.01")?,
        ])
        .build()
        .execute_with_fixture(())
        .await
}

async fn overlap(http: Http, base: String, from: String, to: String) -> stampede::Result<RunReport> {
    let logged = Arc::new(AtomicUsize::new(0));
    let replays = SharedIterations::builder()
        .vus(5)
        .iterations(20)
        .max_duration(Duration::from_secs(30))
        .build();

    Run::builder()
        .scenarios(vec![Scenario::new("overlap", replays, move |ctx: IterationContext<()>| {
            let http = http.clone();
            let spec = replay(&base, &from, &to);
            let logged = logged.clone();
            async move {
                let res = http.request(&ctx, spec).await;
                if res.status != 202 && logged.fetch_add(1, Ordering::Relaxed) < LOG_LIMIT {
                    tracing::info!("Replay rejected: {}", res.summary());
                }
                ctx.check("202 accepted", res.status == 202);
                Ok(())
            }
        })])
        .thresholds(vec![ThresholdRule::parse("http_req_duration", "p(95)<3000")?])
        .build()
        .execute_with_fixture(())
        .await
}

async fn hourly(http: Http, base: String, from: String, to: String) -> stampede::Result<RunReport> {
    let ramp = RampingVus::builder()
        .stages(vec![
            Stage::new(Duration::from_secs(60), 50.0),
            Stage::new(Duration::from_secs(180), 50.0),
            Stage::new(Duration::from_secs(120), 100.0),
            Stage::new(Duration::from_secs(30), 0.0),
        ])
        .build();

    Run::builder()
        .scenarios(vec![Scenario::new("hourly_job", ramp, move |ctx: IterationContext<()>| {
            let http = http.clone();
            let spec = replay(&base, &from, &to);
            async move {
                let res = http.request(&ctx, spec).await;
                ctx.check("status is 202", res.status == 202);
                ctx.sleep(Duration::from_secs(1)).await;
                Ok(())
            }
        })])
        .thresholds(vec![
            ThresholdRule::parse("http_req_duration", "p(95)<3000")?,
            ThresholdRule::parse("http_req_failed", "rate<0.01")?,
        ])
        .build()
        .execute_with_fixture(())
        .await
}

async fn daily(http: Http, base: String, date: String, start_id: u64) -> stampede::Result<RunReport> {
    let users = PerVuIterations::builder()
        .vus(200)
        .iterations(1)
        .max_duration(Duration::from_secs(300))
        .build();

    Run::builder()
        .scenarios(vec![Scenario::new("user_vocab", users, move |ctx: IterationContext<()>| {
            let http = http.clone();
            // VU ids start at 1
            let spec = RequestSpec::post(format!("{base}/api/test/voca/user-daily"))
                .query("userId", start_id + ctx.vu - 1)
                .query("date", &date)
                .query("ignoreTimezone", true)
                .header("Content-Type", "application/json")
                .tag("type", "user_daily");
            async move {
                let res = http.request(&ctx, spec).await;
                ctx.check("status is 200", res.status == 200);
                ctx.sleep(Duration::from_secs(1)).await;
                Ok(())
            }
        })])
        .thresholds(vec![
            ThresholdRule::parse("http_req_duration", "p(95)<2000")?,
            ThresholdRule::parse("http_req_failed", "rate<0.01")?,
        ])
        .build()
        .execute_with_fixture(())
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let http = Http::default();
    let base = cli.base_url.trim_end_matches('/').to_owned();
    let report = match cli.command {
        Commands::Reads {
            member,
            date,
            level,
        } => reads(http, base, member, date, level).await?,
        Commands::Overlap { from, to } => overlap(http, base, from, to).await?,
        Commands::Hourly { from, to } => hourly(http, base, from, to).await?,
        Commands::Daily { date, start_id } => daily(http, base, date, start_id).await?,
    };

    StdoutReporter.report(&report).await?;
    std::process::exit(report.exit_code());
}
