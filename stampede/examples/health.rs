//! Health probe: 10 VUs polling the actuator endpoint with one second of
//! think time.
use std::time::Duration;

use clap::Parser;
use stampede::{
    Reporter, Run, Scenario, ThresholdRule,
    config::parse_duration,
    executor::ConstantVus,
    fixture::NoSetup,
    protocol::{Http, RequestSpec},
    report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,
    #[arg(long, env = "VUS", default_value_t = 10)]
    vus: usize,
    #[arg(long, env = "DURATION", default_value = "30s", value_parser = parse_duration)]
    duration: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    // Clients are built once; every iteration clones the handle
    let http = Http::default();
    let url = format!("{}/actuator/health", args.base_url);
    let scenario = Scenario::new(
        "health",
        ConstantVus::builder()
            .vus(args.vus)
            .duration(args.duration)
            .build(),
        move |ctx| {
            let (http, url) = (http.clone(), url.clone());
            async move {
                let res = http.request(&ctx, RequestSpec::get(url)).await;
                ctx.check("status is 200", res.status == 200);
                ctx.sleep(Duration::from_secs(1)).await;
                Ok(())
            }
        },
    );

    let report = Run::builder()
        .scenarios(vec![scenario])
        .thresholds(vec![
            ThresholdRule::parse("http_req_failed", "rate<0.01")?,
            ThresholdRule::parse("http_req_duration", "p(95)<500")?,
        ])
        .build()
        .execute(NoSetup)
        .await?;

    StdoutReporter.report(&report).await?;
    std::process::exit(report.exit_code());
}
