//! Built-in smoke tests
//!
//! Lets the bundled binary check a server build without a harness of its own.

use anyhow::Context;
use rltest::env::Reply;
use rltest::executor::TestContext;
use rltest::models::{Registry, TestError, TestResult, TestSuite};

pub fn registry() -> Registry {
    Registry::new()
        .function("test_ping", test_ping)
        .function("test_set_get", test_set_get)
        .suite("Keyspace", keyspace)
}

fn test_ping(ctx: &mut TestContext<'_>) -> TestResult {
    let env = ctx.env()?;
    let reply = env.connection()?.command(&["PING"]).context("PING failed")?;
    env.assertions().check_eq(reply.as_text(), Some("PONG".to_string()))
}

fn test_set_get(ctx: &mut TestContext<'_>) -> TestResult {
    let env = ctx.env()?;
    let mut conn = env.connection()?;
    let reply = conn.command(&["SET", "smoke", "value"]).context("SET failed")?;
    env.assertions().check(reply.is_ok(), format!("SET replied {reply}"))?;

    let reply = conn.command(&["GET", "smoke"]).context("GET failed")?;
    env.assertions().check_eq(reply.as_text(), Some("value".to_string()))
}

/// Key lifecycle against a keyspace seeded before every sub-test
struct Keyspace;

impl TestSuite for Keyspace {
    fn set_up(&mut self, ctx: &mut TestContext<'_>) -> TestResult {
        let env = ctx.env()?;
        env.connection()?
            .command(&["SET", "seeded", "1"])
            .context("seeding failed")?;
        Ok(())
    }

    fn sub_tests(&self) -> Vec<&'static str> {
        vec!["test_exists", "test_del"]
    }

    fn run_sub_test(&mut self, name: &str, ctx: &mut TestContext<'_>) -> TestResult {
        let env = ctx.env()?;
        let mut conn = env.connection()?;
        match name {
            "test_exists" => {
                let reply = conn.command(&["EXISTS", "seeded"]).context("EXISTS failed")?;
                env.assertions()
                    .check(matches!(reply, Reply::Integer(1)), format!("EXISTS replied {reply}"))
            }
            "test_del" => {
                conn.command(&["DEL", "seeded"]).context("DEL failed")?;
                let reply = conn.command(&["GET", "seeded"]).context("GET failed")?;
                env.assertions().check_eq(reply.as_text(), None)
            }
            other => Err(TestError::Other(anyhow::anyhow!("unknown sub-test {other}"))),
        }
    }
}

fn keyspace(ctx: &mut TestContext<'_>) -> Result<Box<dyn TestSuite>, TestError> {
    ctx.env()?;
    Ok(Box::new(Keyspace))
}
