use returndesk_agent::llm::OpenAiCompatibleClient;
use returndesk_agent::retrieval::PolicyDocumentRetriever;
use returndesk_core::config::{AppConfig, LoadOptions};
use returndesk_db::{connect_with_settings, migrations, DataStoreGateway, DbPool, SqliteDataStore};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 3] = ["policy_document", "completion_endpoint", "order_store"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_policy_document(&config));
            checks.push(check_completion_endpoint(&config));
            checks.push(check_order_store(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.iter().map(|&name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_policy_document(config: &AppConfig) -> DoctorCheck {
    match PolicyDocumentRetriever::load(&config.policy.document_path, config.policy.max_passages) {
        Ok(retriever) => DoctorCheck {
            name: "policy_document",
            status: CheckStatus::Pass,
            details: format!("{} passages in `{}`", retriever.passage_count(), retriever.source()),
        },
        Err(error) => DoctorCheck {
            name: "policy_document",
            status: CheckStatus::Fail,
            details: format!("{error:#}"),
        },
    }
}

/// Builds the client only; no request is sent.
fn check_completion_endpoint(config: &AppConfig) -> DoctorCheck {
    match OpenAiCompatibleClient::from_config(&config.llm) {
        Ok(client) => DoctorCheck {
            name: "completion_endpoint",
            status: CheckStatus::Pass,
            details: format!(
                "{:?} client for model `{}` at {}",
                config.llm.provider,
                config.llm.model,
                client.endpoint()
            ),
        },
        Err(error) => DoctorCheck {
            name: "completion_endpoint",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_order_store(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "order_store",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| format!("migrations could not be applied: {error}"))?;
        let orders = count_orders(&pool).await?;

        pool.close().await;
        Ok::<i64, String>(orders)
    });

    match result {
        Ok(orders) => DoctorCheck {
            name: "order_store",
            status: CheckStatus::Pass,
            details: format!("connected using `{}` ({orders} orders)", config.database.url),
        },
        Err(error) => DoctorCheck { name: "order_store", status: CheckStatus::Fail, details: error },
    }
}

/// Reads through the same read-only path the assistant uses.
async fn count_orders(pool: &DbPool) -> Result<i64, String> {
    let rows = SqliteDataStore::new(pool.clone())
        .execute("SELECT COUNT(*) AS orders FROM orders")
        .await
        .map_err(|error| format!("orders table is not readable: {error}"))?;
    Ok(rows
        .first()
        .and_then(|row| row.get("orders"))
        .and_then(serde_json::Value::as_i64)
        .unwrap_or_default())
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
