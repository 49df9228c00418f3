//! Small jobs shipped with the binary, useful for smoke tests and demos.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::jobs::job::{Job, JobArguments, JobContext, JobFailure, JobMeta};
use crate::jobs::registry::StaticSource;
use crate::jobs::schema::{InputSchema, Variable};

pub const SOURCE: &str = "builtin";

/// Returns its input as the result payload.
pub struct Echo;

#[async_trait]
impl Job for Echo {
    fn meta(&self) -> JobMeta {
        JobMeta::new("Echo")
            .with_grouping("Demo")
            .with_description("Log and return the given message")
            .reentrant()
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().var(Variable::string("message").required())
    }

    async fn run(&self, ctx: &JobContext, args: JobArguments) -> Result<Value, JobFailure> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ctx.log_info(format!("echo: {}", message)).await;
        Ok(json!({ "message": message }))
    }
}

/// Sleeps in one-second steps, stopping early on cancellation or when the
/// soft time limit passes.
pub struct Sleep;

#[async_trait]
impl Job for Sleep {
    fn meta(&self) -> JobMeta {
        JobMeta::new("Sleep")
            .with_grouping("Demo")
            .with_description("Wait for a number of seconds")
            .with_dryrun(false)
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().var(
            Variable::integer("seconds", Some(0), Some(86_400)).with_default(json!(5)),
        )
    }

    async fn run(&self, ctx: &JobContext, args: JobArguments) -> Result<Value, JobFailure> {
        let seconds = args.get("seconds").and_then(Value::as_u64).unwrap_or(5);
        if ctx.dryrun {
            ctx.log_info(format!("dry run: would sleep {}s", seconds)).await;
            return Ok(json!({ "slept": 0 }));
        }
        let mut slept = 0;
        while slept < seconds {
            ctx.checkpoint()?;
            if ctx.soft_limit_reached() {
                ctx.log_warning("stopping early, soft time limit reached").await;
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += 1;
        }
        ctx.log_success(format!("slept {}s", slept)).await;
        Ok(json!({ "slept": slept }))
    }
}

/// Always fails with the given message.
pub struct Fail;

#[async_trait]
impl Job for Fail {
    fn meta(&self) -> JobMeta {
        JobMeta::new("Fail")
            .with_grouping("Demo")
            .with_description("Fail with the given message")
            .reentrant()
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().var(Variable::string("message").with_default(json!("requested failure")))
    }

    async fn run(&self, ctx: &JobContext, args: JobArguments) -> Result<Value, JobFailure> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string();
        ctx.log_info("about to fail").await;
        Err(JobFailure::new(message))
    }
}

pub fn builtin_source() -> StaticSource {
    StaticSource::new(SOURCE)
        .register("demo.Echo", || Echo)
        .register("demo.Sleep", || Sleep)
        .register("demo.Fail", || Fail)
}
