//! Read-heavy quiz traffic: a hot first page, cold deep pages and detail
//! lookups of known quizzes, all at fixed arrival rates.
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use rand::Rng;
use serde_json::json;
use stampede::{
    IterationContext, IterationError, Reporter, Run,
    config::{Credentials, RunOptions, read_lines},
    fallback::FallbackChain,
    fixture::SetupError,
    iteration::{Action, action},
    protocol::{Http, RequestSpec},
    report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080/api/test/quiz")]
    base_url: String,
    #[arg(long, env = "MEMBERNAME", default_value = "user1")]
    membername: String,
    #[arg(long, env = "HOT_RPS", default_value_t = 300)]
    hot_rps: u32,
    #[arg(long, env = "COLD_RPS", default_value_t = 200)]
    cold_rps: u32,
    #[arg(long, env = "DETAIL_RPS", default_value_t = 250)]
    detail_rps: u32,
    #[arg(long, env = "DURATION", default_value = "10s")]
    duration: String,
    #[arg(long, env = "PRE_VUS", default_value_t = 60)]
    pre_vus: usize,
    #[arg(long, env = "MAX_VUS", default_value_t = 300)]
    max_vus: usize,
    /// Deepest page the cold scenario asks for.
    #[arg(long, env = "MAX_PAGE", default_value_t = 80_000)]
    max_page: u64,
    #[arg(long, env = "PAGE_SIZE", default_value_t = 20)]
    page_size: u32,
    /// Newline-delimited quiz ids; fetched from the backend when absent.
    #[arg(long, env = "UUIDS_FILE")]
    uuids_file: Option<PathBuf>,
    #[arg(long, env = "SCAN_MAX_UUIDS", default_value_t = 150_000)]
    scan_max_uuids: usize,
    #[arg(long, env = "TOKENS")]
    tokens: Option<String>,
    #[arg(long, env = "TOKENS_FILE")]
    tokens_file: Option<PathBuf>,
}

#[derive(Debug)]
struct Settings {
    base: String,
    membername: String,
    max_page: u64,
    page_size: u32,
    credentials: Credentials,
}

impl Settings {
    /// A `/me` page with a random status filter.
    fn page(&self, ctx: &mut IterationContext<Uuids>, page: u64) -> RequestSpec {
        let status = if ctx.rng.random_bool(0.5) { "SUBMIT" } else { "PENDING" };
        RequestSpec::get(format!("{}/me", self.base))
            .query("membername", &self.membername)
            .query("page", page)
            .query("size", self.page_size)
            .query("status", status)
            .bearer(self.credentials.pick(&mut ctx.rng))
            .tag("api", "quiz")
    }
}

async fn think(ctx: &mut IterationContext<Uuids>, max_secs: f64) {
    let pause = ctx.rng.random_range(0.0..max_secs);
    ctx.sleep(Duration::from_secs_f64(pause)).await;
}

type Uuids = Vec<String>;

async fn load_uuids(http: &Http, args: &Args, settings: &Settings) -> Result<Uuids, SetupError> {
    let listed = RequestSpec::get(format!("{}/uuids", settings.base))
        .query("membername", &settings.membername)
        .query("limit", args.scan_max_uuids)
        .bearer(settings.credentials.first())
        .tag("type", "scan");
    let uuids = FallbackChain::new()
        .then("uuids file", Duration::from_secs(5), move || async move {
            match args.uuids_file.as_deref() {
                Some(path) => read_lines(path).map_err(|e| e.to_string()),
                None => Err("UUIDS_FILE is not set".to_owned()),
            }
        })
        .then("uuids endpoint", Duration::from_secs(60), move || async move {
            http.fetch_json::<Uuids>(listed).await
        })
        .resolve()
        .await
        .map_err(|e| SetupError::new("quiz uuids", e.to_string()))?;
    if uuids.is_empty() {
        return Err(SetupError::new("quiz uuids", "no quiz ids available"));
    }
    tracing::info!("Loaded {} quiz ids", uuids.len());
    Ok(uuids)
}

fn scenario_functions(http: Http, settings: Arc<Settings>) -> impl Fn(&str) -> Option<Action<Uuids>> {
    move |exec| {
        let http = http.clone();
        let settings = settings.clone();
        let f = match exec {
            "hotPage" => action(move |mut ctx: IterationContext<Uuids>| {
                let (http, settings) = (http.clone(), settings.clone());
                async move {
                    let spec = settings.page(&mut ctx, 0).tag("type", "list_hot");
                    let res = http.request(&ctx, spec).await;
                    ctx.check("hot 200", res.status == 200);
                    think(&mut ctx, 0.05).await;
                    Ok(())
                }
            }),
            "coldPage" => action(move |mut ctx: IterationContext<Uuids>| {
                let (http, settings) = (http.clone(), settings.clone());
                async move {
                    let low = settings.max_page * 6 / 10;
                    let page = ctx.rng.random_range(low..=settings.max_page);
                    let spec = settings.page(&mut ctx, page).tag("type", "list_cold");
                    let res = http.request(&ctx, spec).await;
                    ctx.check("cold 2xx-ish", [200, 204, 206].contains(&res.status));
                    think(&mut ctx, 0.1).await;
                    Ok(())
                }
            }),
            "detailOne" => action(move |mut ctx: IterationContext<Uuids>| {
                let (http, settings) = (http.clone(), settings.clone());
                async move {
                    let n = ctx.fixture().len();
                    if n == 0 {
                        return Err(IterationError::precondition("no quiz ids in the fixture"));
                    }
                    let i = ctx.rng.random_range(0..n);
                    let token = settings.credentials.pick(&mut ctx.rng);
                    let spec = RequestSpec::get(format!("{}/{}", settings.base, ctx.fixture()[i]))
                        .bearer(token)
                        .tag("api", "quiz")
                        .tag("type", "detail");
                    let res = http.request(&ctx, spec).await;
                    ctx.check("detail 200", res.status == 200);
                    think(&mut ctx, 0.05).await;
                    Ok(())
                }
            }),
            _ => return None,
        };
        Some(f)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let settings = Arc::new(Settings {
        base: args.base_url.trim_end_matches('/').to_owned(),
        membername: args.membername.clone(),
        max_page: args.max_page,
        page_size: args.page_size,
        credentials: Credentials::load(args.tokens_file.as_deref(), args.tokens.as_deref()),
    });
    let http = Http::default();

    let arrival = |rate: u32, exec: &str| {
        json!({
            "executor": "constant-arrival-rate",
            "exec": exec,
            "rate": rate,
            "timeUnit": "1s",
            "duration": args.duration,
            "preAllocatedVUs": args.pre_vus,
            "maxVUs": args.max_vus,
        })
    };
    let options = json!({
        "scenarios": {
            "hot_page": arrival(args.hot_rps, "hotPage"),
            "cold_page": arrival(args.cold_rps, "coldPage"),
            "detail": arrival(args.detail_rps, "detailOne"),
        },
        "thresholds": {
            "http_req_failed{api:quiz}": ["rate<0.05"],
            "http_req_duration{type:list_hot}": ["p(95)<2000"],
            "http_req_duration{type:list_cold}": ["p(95)<4000"],
            "http_req_duration{type:detail}": ["p(95)<2000"],
        },
    });
    let options = RunOptions::from_json(&options.to_string())?;
    let run = Run::from_options(&options, scenario_functions(http.clone(), settings.clone()))?;

    let report = run.execute(|| load_uuids(&http, &args, &settings)).await?;
    StdoutReporter.report(&report).await?;
    std::process::exit(report.exit_code());
}
