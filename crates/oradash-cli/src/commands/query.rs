use std::time::Duration;

use anyhow::{Context as _, bail};
use oradash_core::{BindValue, Binds, ExecuteOptions, Value};

use super::{Context, print_json};

/// Largest text OUT bind the CLI asks the server for.
const OUT_TEXT_LEN: u32 = 4000;

pub struct QueryRequest {
    pub sql: String,
    pub binds: Vec<String>,
    pub outs: Vec<String>,
    pub timeout: Option<f64>,
    pub max_rows: Option<usize>,
    pub auto_commit: bool,
}

pub async fn run(ctx: &Context, target: &str, request: QueryRequest) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    let binds = parse_binds(&request.binds, &request.outs)?;

    let mut options = ExecuteOptions {
        auto_commit: request.auto_commit,
        max_rows: request.max_rows,
        ..Default::default()
    };
    if let Some(secs) = request.timeout {
        if !secs.is_finite() || secs <= 0.0 {
            bail!("--timeout must be a positive number of seconds");
        }
        options.timeout = Some(Duration::from_secs_f64(secs));
    }

    let output = ctx
        .backend
        .execute_query(&config, &request.sql, &binds, &options)
        .await
        .context("statement failed")?;
    print_json(&output)
}

/// Build named binds from `name=value` inputs and OUT names.
///
/// Values that parse as integers or floats are bound as numbers; everything
/// else is text. An empty value binds NULL.
fn parse_binds(inputs: &[String], outs: &[String]) -> anyhow::Result<Binds> {
    if inputs.is_empty() && outs.is_empty() {
        return Ok(Binds::None);
    }
    let mut pairs = Vec::with_capacity(inputs.len() + outs.len());
    for input in inputs {
        let (name, raw) = input
            .split_once('=')
            .with_context(|| format!("bind {input:?} is not name=value"))?;
        let name = name.trim().trim_start_matches(':');
        if name.is_empty() {
            bail!("bind {input:?} has an empty name");
        }
        pairs.push((name.to_string(), BindValue::In(parse_value(raw))));
    }
    for name in outs {
        let name = name.trim().trim_start_matches(':');
        pairs.push((name.to_string(), BindValue::OutText { max_len: OUT_TEXT_LEN }));
    }
    Ok(Binds::Named(pairs))
}

fn parse_value(raw: &str) -> Value {
    if raw.is_empty() {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_are_typed_from_text() {
        let binds = parse_binds(
            &["id=42".into(), ":ratio=0.5".into(), "name=SCOTT".into(), "note=".into()],
            &["result".into()],
        )
        .unwrap();
        let Binds::Named(pairs) = binds else {
            panic!("expected named binds");
        };
        assert_eq!(pairs[0], ("id".to_string(), BindValue::In(Value::Int(42))));
        assert_eq!(pairs[1], ("ratio".to_string(), BindValue::In(Value::Float(0.5))));
        assert_eq!(pairs[2].1, BindValue::In(Value::from("SCOTT")));
        assert_eq!(pairs[3].1, BindValue::In(Value::Null));
        assert_eq!(pairs[4].1, BindValue::OutText { max_len: OUT_TEXT_LEN });
    }

    #[test]
    fn malformed_binds_are_rejected() {
        assert!(parse_binds(&["novalue".into()], &[]).is_err());
        assert!(parse_binds(&["=5".into()], &[]).is_err());
        assert_eq!(parse_binds(&[], &[]).unwrap(), Binds::None);
    }
}
