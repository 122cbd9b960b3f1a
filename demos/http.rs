use std::{process::ExitCode, time::Duration};

use reqwest::{Client, StatusCode};
use stampede::{
    BoxError, JsonReporter, MetricKind, Reporter, RunOptions, Runner, StdoutReporter, Tags,
    VuContext,
};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// `name` tag of the health-check request.
const REQUEST_NAME: &str = "GET_/api/health";

const OPTIONS: &str = r#"
stages:
  - { duration: 1m, target: 20 }
  - { duration: 3m, target: 20 }
  - { duration: 1m, target: 0 }
thresholds:
  errors: rate<0.01
  http_req_duration: p(95)<800
  "http_req_duration{name:GET_/api/health}": p(99)<1500
metrics:
  errors: rate
  ttfb: trend
  http_req_duration: trend
"#;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into());
    let token = std::env::var("TOKEN").ok();
    let url = format!("{base_url}/api/health");

    let options = match std::env::var("OPTIONS") {
        Ok(path) => RunOptions::from_file(path),
        Err(_) => RunOptions::from_yaml_str(OPTIONS),
    };
    let options = match options {
        Ok(options) => options,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    // Build the client once, every VU shares its connection pool
    let client = Client::new();
    let action = move |ctx: VuContext| {
        let client = client.clone();
        let url = url.clone();
        let token = token.clone();
        async move {
            let mut request = client.get(&url);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let start = Instant::now();
            let response = request.send().await;
            // headers are in, close enough to time-to-first-byte
            ctx.add_trend("ttfb", start.elapsed().as_secs_f64() * 1000.0);

            let ok = match response {
                Ok(res) => {
                    let status = res.status();
                    let body = res.bytes().await;
                    ctx.add_with_tags(
                        "http_req_duration",
                        MetricKind::Trend,
                        start.elapsed().as_secs_f64() * 1000.0,
                        Tags::from([("name".to_string(), REQUEST_NAME.to_string())]),
                    );
                    ctx.check("status 200", status == StatusCode::OK) && body.is_ok()
                }
                Err(e) => {
                    tracing::debug!("VU {} request failed: {e}", ctx.ordinal());
                    ctx.check("status 200", false)
                }
            };
            ctx.add_rate("errors", !ok);

            ctx.sleep(Duration::from_secs(1)).await;
            Ok::<(), BoxError>(())
        }
    };

    let runner = options
        .scenario("health check", action)
        .and_then(|scenario| Runner::new(scenario, options.stage_executor()));
    let runner = match runner {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    let result = runner.run().await;
    if let Err(e) = StdoutReporter.report(&result).await {
        tracing::error!("Failed to print the summary: {e}");
    }
    if let Ok(path) = std::env::var("SUMMARY_JSON") {
        if let Err(e) = JsonReporter::to_file(path).report(&result).await {
            tracing::error!("Failed to write the JSON summary: {e}");
        }
    }
    ExitCode::from(result.exit_code() as u8)
}
