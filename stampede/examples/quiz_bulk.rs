//! Steady quiz traffic: start a daily or random quiz, work out how many
//! questions it has, then submit answers for all of them.
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use stampede::{
    IterationContext, Reporter, Run, Scenario, ThresholdRule,
    config::{Credentials, parse_duration},
    executor::ConstantArrivalRate,
    fallback::FallbackChain,
    protocol::{ExpectedStatuses, Http, RequestSpec},
    report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

const DAYS: [&str; 5] = ["2025-08-09", "2025-08-10", "2025-08-12", "2025-08-13", "2025-08-14"];
const LEVELS: [Option<&str>; 4] = [None, Some("A"), Some("B"), Some("C")];
const DEFAULT_QUESTIONS: usize = 5;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080/api/test/quiz")]
    base_url: String,
    #[arg(long, env = "MEMBERNAME", default_value = "user1")]
    membername: String,
    #[arg(long, env = "RPS", default_value_t = 400.0)]
    rps: f64,
    #[arg(long, env = "DURATION", default_value = "30s", value_parser = parse_duration)]
    duration: Duration,
    #[arg(long, env = "PRE_VUS", default_value_t = 80)]
    pre_vus: usize,
    #[arg(long, env = "MAX_VUS", default_value_t = 400)]
    max_vus: usize,
    #[arg(long, env = "TOKENS")]
    tokens: Option<String>,
    #[arg(long, env = "TOKENS_FILE")]
    tokens_file: Option<PathBuf>,
}

/// Body of a start call. Some deployments name the id `quizUUID`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Started {
    Quiz {
        #[serde(alias = "quizUUID")]
        uuid: String,
        #[serde(rename = "quizQuestions")]
        quiz_questions: Option<Vec<Value>>,
    },
    Unknown(Value),
}

/// A `/me` page: a Spring page, an `items` wrapper or a bare list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuizPage {
    Content { content: Vec<QuizSummary> },
    Items { items: Vec<QuizSummary> },
    Bare(Vec<QuizSummary>),
    Unknown(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuizSummary {
    uuid: Option<String>,
    #[serde(rename = "quizUUID")]
    quiz_uuid: Option<String>,
    total_questions: Option<usize>,
    questions: Option<Vec<Value>>,
    quiz_questions: Option<Vec<Value>>,
}

impl QuizSummary {
    fn id(&self) -> Option<&str> {
        self.uuid.as_deref().or(self.quiz_uuid.as_deref())
    }

    fn question_count(&self) -> Option<usize> {
        self.total_questions
            .or(self.questions.as_ref().map(Vec::len))
            .or(self.quiz_questions.as_ref().map(Vec::len))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuizDetail {
    Questions {
        #[serde(rename = "quizQuestions", alias = "questions")]
        questions: Vec<Value>,
    },
    Unknown(Value),
}

#[derive(Debug)]
struct Settings {
    base: String,
    membername: String,
    credentials: Credentials,
}

async fn count_from_me(
    http: &Http,
    ctx: &IterationContext<()>,
    settings: &Settings,
    token: &str,
    uuid: &str,
) -> Result<usize, String> {
    let spec = RequestSpec::get(format!("{}/me", settings.base))
        .query("membername", &settings.membername)
        .query("page", 0)
        .query("size", 20)
        .query("status", "PENDING")
        .bearer(token)
        .tag("api", "quiz")
        .tag("type", "me");
    let res = http.request(ctx, spec).await;
    if res.status != 200 {
        return Err(format!("status {}", res.status));
    }
    let items = match res.json::<QuizPage>().map_err(|e| e.to_string())? {
        QuizPage::Content { content: items } | QuizPage::Items { items } | QuizPage::Bare(items) => {
            items
        }
        QuizPage::Unknown(_) => return Err("unrecognised page shape".into()),
    };
    items
        .iter()
        .find(|item| item.id() == Some(uuid))
        .ok_or_else(|| format!("{uuid} is not listed"))?
        .question_count()
        .filter(|&n| n > 0)
        .ok_or_else(|| "no question count".into())
}

async fn count_from_detail(
    http: &Http,
    ctx: &IterationContext<()>,
    settings: &Settings,
    token: &str,
    uuid: &str,
) -> Result<usize, String> {
    let spec = RequestSpec::get(format!("{}/{uuid}", settings.base))
        .query("membername", &settings.membername)
        .bearer(token)
        .tag("api", "quiz")
        .tag("type", "detail");
    let res = http.request(ctx, spec).await;
    if res.status != 200 {
        return Err(format!("status {}", res.status));
    }
    match res.json::<QuizDetail>().map_err(|e| e.to_string())? {
        QuizDetail::Questions { questions } if !questions.is_empty() => Ok(questions.len()),
        _ => Err("no questions in detail".into()),
    }
}

async fn start_and_submit(
    http: Http,
    settings: Arc<Settings>,
    mut ctx: IterationContext<()>,
) -> stampede::IterationResult {
    let token = settings.credentials.pick(&mut ctx.rng).to_owned();

    let start = if ctx.rng.random_bool(0.5) {
        let day = DAYS[ctx.rng.random_range(0..DAYS.len())];
        RequestSpec::post(format!("{}/daily/start", settings.base))
            .query("membername", &settings.membername)
            .query("date", day)
    } else {
        let spec = RequestSpec::post(format!("{}/random/start", settings.base))
            .query("membername", &settings.membername);
        match LEVELS[ctx.rng.random_range(0..LEVELS.len())] {
            Some(level) => spec.query("level", level),
            None => spec,
        }
    };
    let start = start
        .header("Content-Type", "application/json")
        .bearer(&token)
        .tag("api", "quiz")
        .tag("type", "start");
    let res = http.request(&ctx, start).await;
    ctx.check(
        "start ok (2xx/409/422/429)",
        (200..300).contains(&res.status) || [409, 422, 429].contains(&res.status),
    );

    let (uuid, from_start) = match res.json::<Started>() {
        Ok(Started::Quiz {
            uuid,
            quiz_questions,
        }) => (uuid, quiz_questions.map(|q| q.len()).filter(|&n| n > 0)),
        Ok(Started::Unknown(_)) => return Ok(()),
        Err(e) => {
            tracing::debug!("Start response is not JSON: {e}");
            return Ok(());
        }
    };

    let questions = FallbackChain::new()
        .then("me", LOOKUP_TIMEOUT, || {
            count_from_me(&http, &ctx, &settings, &token, &uuid)
        })
        .then("start response", LOOKUP_TIMEOUT, || async move {
            from_start.ok_or("start response had no questions")
        })
        .then("detail", LOOKUP_TIMEOUT, || {
            count_from_detail(&http, &ctx, &settings, &token, &uuid)
        })
        .resolve()
        .await
        .unwrap_or_else(|e| {
            tracing::debug!("Falling back to {DEFAULT_QUESTIONS} questions: {e}");
            DEFAULT_QUESTIONS
        });

    // Choices are 1-based
    let selected: Vec<u32> = (0..questions)
        .map(|_| ctx.rng.random_range(1..=4))
        .collect();
    let submit = RequestSpec::post(format!("{}/{uuid}/submit", settings.base))
        .json(&json!({ "selected": selected }))?
        .bearer(&token)
        .tag("api", "quiz")
        .tag("type", "submit");
    let res = http.request(&ctx, submit).await;
    tracing::debug!("Submit {uuid}: {}", res.summary());
    ctx.check(
        "submit ok (200/409/4xx)",
        [200, 409, 400, 401, 403, 404, 422].contains(&res.status),
    );

    let pause = ctx.rng.random_range(0.0..0.05);
    ctx.sleep(Duration::from_secs_f64(pause)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let settings = Arc::new(Settings {
        base: args.base_url.trim_end_matches('/').to_owned(),
        membername: args.membername,
        credentials: Credentials::load(args.tokens_file.as_deref(), args.tokens.as_deref()),
    });
    tracing::info!("Using {}", settings.credentials);

    // Some 4xx are expected under contention and do not count as failures
    let http = Http::builder()
        .expected(ExpectedStatuses::of(&[
            200, 201, 202, 204, 206, 400, 401, 403, 404, 409, 422, 429,
        ]))
        .build();
    let steady = Scenario::new(
        "steady",
        ConstantArrivalRate::builder()
            .rate(args.rps)
            .duration(args.duration)
            .pre_allocated_vus(args.pre_vus)
            .max_vus(args.max_vus)
            .build(),
        move |ctx| start_and_submit(http.clone(), settings.clone(), ctx),
    );

    let report = Run::builder()
        .scenarios(vec![steady])
        .thresholds(vec![
            ThresholdRule::parse("http_req_failed{api:quiz}", "rate<0.05")?,
            ThresholdRule::parse("http_req_duration{type:start}", "p(95)<2500")?,
            ThresholdRule::parse("http_req_duration{type:submit}", "p(95)<2500")?,
        ])
        .build()
        .execute_with_fixture(())
        .await?;

    StdoutReporter.report(&report).await?;
    std::process::exit(report.exit_code());
}
