mod config;
mod telemetry;

use std::{env, fs, process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use insight_chain::{
    ChainConfig, ConnectionAccessor, LlmSqlGenerator, LlmSummarizer, OpenAiCompatClient, Pipeline,
    PipelineRequest, PromptSections, SqlExecutor, SqlitePoolAccessor, ValidationService,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{chain_config, AppConfig, ProcessEnv};

const USAGE: &str = "usage:
  insight ask <question> [--session <id>] [--schema <file>]
  insight health
  insight validate <sql> [--actor <id>]";

const SYSTEM_CONTEXT: &str = "You are an analytics assistant for a payments platform. \
Answer questions by querying the payments database. Amounts are stored in minor units.";

const SCHEMA_SQL: &str =
    "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND sql IS NOT NULL ORDER BY name";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Ask {
        question: String,
        session_id: Option<String>,
        schema_file: Option<String>,
    },
    Health,
    Validate {
        sql: String,
        actor_id: String,
    },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        bail!("missing command\n{USAGE}");
    };

    let mut positional = Vec::new();
    let mut options = Vec::new();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if let Some(name) = arg.strip_prefix("--") {
            let value = iter
                .next()
                .with_context(|| format!("--{name} needs a value\n{USAGE}"))?;
            options.push((name, value.clone()));
        } else {
            positional.push(arg.as_str());
        }
    }
    let option = |wanted: &str| {
        options
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, value)| value.clone())
    };

    match command.as_str() {
        "ask" => {
            if positional.is_empty() {
                bail!("ask needs a question\n{USAGE}");
            }
            Ok(Command::Ask {
                question: positional.join(" "),
                session_id: option("session"),
                schema_file: option("schema"),
            })
        }
        "health" => Ok(Command::Health),
        "validate" => {
            if positional.is_empty() {
                bail!("validate needs a SQL statement\n{USAGE}");
            }
            Ok(Command::Validate {
                sql: positional.join(" "),
                actor_id: option("actor").unwrap_or_else(|| "cli".to_string()),
            })
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = parse_args(&args)?;
    let _telemetry = telemetry::init("insight");

    match command {
        Command::Validate { sql, actor_id } => {
            let chain = chain_config(&ProcessEnv);
            let report = ValidationService::new(chain.validation.clone()).validate(&sql, &actor_id);
            print_json(&report)?;
            Ok(exit_code(report.is_valid()))
        }
        Command::Health => {
            let app = AppConfig::from_env()?;
            let accessor =
                SqlitePoolAccessor::connect(&app.database_url, app.db_max_connections).await?;
            let pipeline = build_pipeline(app.chain)?;
            let report = pipeline.health_check(&accessor).await;
            print_json(&report)?;
            Ok(exit_code(report.unhealthy_services.is_empty()))
        }
        Command::Ask {
            question,
            session_id,
            schema_file,
        } => {
            let app = AppConfig::from_env()?;
            let accessor =
                SqlitePoolAccessor::connect(&app.database_url, app.db_max_connections).await?;
            let tool_context = match schema_file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read schema file {path}"))?,
                None => schema_context(&accessor, &app.chain).await?,
            };
            let prompt = PromptSections {
                system: SYSTEM_CONTEXT.to_string(),
                tool: tool_context,
                user: question.clone(),
            }
            .render();

            let pipeline = build_pipeline(app.chain)?;
            let mut request = PipelineRequest::new(prompt, question);
            request.session_id = session_id;

            let result = pipeline.process_with_retry(&request, &accessor).await;
            info!(
                session_id = %result.session_id,
                response_type = result.response_type.as_str(),
                total_ms = result.total_processing_time_ms,
                "question answered"
            );
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
    }
}

fn build_pipeline(chain: ChainConfig) -> Result<Pipeline> {
    let client = Arc::new(
        OpenAiCompatClient::from_config(&chain.llm).context("language model client")?,
    );
    Ok(Pipeline::new(
        Arc::new(LlmSqlGenerator::new(client.clone())),
        Arc::new(SqlExecutor::new()),
        Arc::new(LlmSummarizer::new(client)),
        chain,
    ))
}

/// Table definitions the generator may use: the allow-listed tables that
/// exist in the database.
async fn schema_context(accessor: &dyn ConnectionAccessor, chain: &ChainConfig) -> Result<String> {
    let tables = accessor
        .fetch(SCHEMA_SQL, 1_000)
        .await
        .context("failed to read database schema")?;

    let allowed = &chain.validation.allowed_tables;
    let definitions: Vec<String> = tables
        .rows
        .iter()
        .filter(|row| {
            row.get("name")
                .and_then(|name| name.as_str())
                .is_some_and(|name| allowed.iter().any(|t| t.eq_ignore_ascii_case(name)))
        })
        .filter_map(|row| row.get("sql").and_then(|sql| sql.as_str()))
        .map(|sql| format!("{sql};"))
        .collect();

    if definitions.is_empty() {
        warn!(?allowed, "no allow-listed tables found in the database");
        return Ok(format!("Available tables: {}", allowed.join(", ")));
    }
    Ok(format!(
        "Available tables:\n{}",
        definitions.join("\n")
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialise output")?;
    println!("{json}");
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
