use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use stampede::{
    Error, IterationContext, Run, Scenario, StopReason, ThresholdRule,
    executor::{ConstantArrivalRate, ConstantVus},
    fixture::{NoSetup, SetupError},
    protocol::{Http, RequestSpec},
};
use wiremock::{
    Mock, MockServer, Request, Respond, ResponseTemplate,
    matchers::{method, path, path_regex},
};

fn arrivals(rate: f64, secs: u64) -> ConstantArrivalRate {
    ConstantArrivalRate::builder()
        .rate(rate)
        .duration(Duration::from_secs(secs))
        .pre_allocated_vus(5)
        .max_vus(20)
        .build()
}

/// Answers 200 and 500 in turn.
struct Alternating(AtomicUsize);

impl Respond for Alternating {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        match self.0.fetch_add(1, Ordering::SeqCst) % 2 {
            0 => ResponseTemplate::new(200),
            _ => ResponseTemplate::new(500),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn steady_rate_against_a_healthy_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"UP"}"#))
        .mount(&server)
        .await;

    let http = Http::default();
    let url = format!("{}/health", server.uri());
    let health = move |ctx: IterationContext<()>| {
        let (http, url) = (http.clone(), url.clone());
        async move {
            let res = http.request(&ctx, RequestSpec::get(url).tag("type", "health")).await;
            ctx.check("status is 200", res.status == 200);
            Ok(())
        }
    };
    let report = Run::builder()
        .scenarios(vec![Scenario::new("health", arrivals(10.0, 2), health)])
        .thresholds(vec![
            ThresholdRule::parse("http_req_failed", "rate<0.01").unwrap(),
            ThresholdRule::parse("http_req_duration{type:health}", "p(95)<1000").unwrap(),
        ])
        .build()
        .execute(NoSetup)
        .await
        .unwrap();

    let requests = report.metrics.http.requests;
    assert!((19..=21).contains(&requests), "{requests} requests");
    assert_eq!(server.received_requests().await.unwrap().len() as u64, requests);
    assert_eq!(report.metrics.http.failed.rate, Some(0.0));
    assert_eq!(report.metrics.checks.fails, 0);
    assert_eq!(report.metrics.dropped_iterations, 0);
    assert!(report.thresholds.iter().all(|t| !t.failed));
    assert!(report.stopped_by.is_none());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_backend_trips_an_aborting_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(Alternating(AtomicUsize::new(0)))
        .mount(&server)
        .await;

    let http = Http::default();
    let url = format!("{}/flaky", server.uri());
    let flaky = move |ctx: IterationContext<()>| {
        let (http, url) = (http.clone(), url.clone());
        async move {
            http.request(&ctx, RequestSpec::get(url)).await;
            Ok(())
        }
    };
    let report = Run::builder()
        .scenarios(vec![Scenario::new("flaky", arrivals(20.0, 30), flaky)])
        .thresholds(vec![
            ThresholdRule::parse("http_req_failed", "rate<0.01")
                .unwrap()
                .abort_on_fail(),
        ])
        .threshold_cadence(Duration::from_millis(500))
        .build()
        .execute(NoSetup)
        .await
        .unwrap();

    assert!(matches!(
        report.stopped_by,
        Some(StopReason::ThresholdAbort { .. })
    ));
    assert!(report.duration < Duration::from_secs(10), "{:?}", report.duration);
    let started: u64 = report.scenarios.iter().map(|s| s.started).sum();
    assert_eq!(started, report.metrics.iterations.iterations);
    assert!(report.thresholds[0].failed);
    assert!(!report.passed());
    assert_eq!(report.exit_code(), 99);
}

#[tokio::test]
async fn unavailable_setup_endpoint_aborts_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/chat/rooms"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let http = Http::default();
    let rooms_url = format!("{}/api/test/chat/rooms", server.uri());
    let setup = || async { http.fetch_json::<Vec<String>>(RequestSpec::get(&rooms_url)).await };

    let err = Run::builder()
        .scenarios(vec![Scenario::new(
            "never",
            arrivals(10.0, 1),
            |_: IterationContext<Vec<String>>| async { Ok(()) },
        )])
        .build()
        .execute(setup)
        .await
        .unwrap_err();

    let Error::Setup(SetupError { response, .. }) = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(response.as_deref(), Some("503: maintenance"));
    // Only the setup call reached the server
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_iterations_share_one_fixture() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rooms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(["a", "b", "c"]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/rooms/[abc]$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let http = Http::default();
    let base = server.uri();
    let setup = {
        let (http, base) = (http.clone(), base.clone());
        move || {
            let (http, base) = (http.clone(), base.clone());
            async move {
                let rooms = RequestSpec::get(format!("{base}/rooms"));
                http.fetch_json::<Vec<String>>(rooms).await
            }
        }
    };
    let expected = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
    let visit = move |mut ctx: IterationContext<Vec<String>>| {
        let (http, base, expected) = (http.clone(), base.clone(), expected.clone());
        async move {
            ctx.check("fixture intact", ctx.fixture() == &expected);
            let room = ctx.pick(&expected).cloned().unwrap_or_default();
            http.request(&ctx, RequestSpec::get(format!("{base}/rooms/{room}"))).await;
            ctx.sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    };

    let report = Run::builder()
        .scenarios(vec![Scenario::new(
            "visit",
            ConstantVus::builder().vus(4).duration(Duration::from_secs(1)).build(),
            visit,
        )])
        .build()
        .execute(setup)
        .await
        .unwrap();

    assert!(report.metrics.iterations.iterations >= 8);
    assert_eq!(report.metrics.checks.fails, 0);
    assert_eq!(report.metrics.http.failed.rate, Some(0.0));
}
