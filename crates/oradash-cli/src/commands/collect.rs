use super::{Context, print_json};

pub async fn top_sql(ctx: &Context, target: &str, limit: u32) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    let stats = ctx.backend.collect_sql_statistics(&config, limit).await?;
    print_json(&stats)
}

pub async fn waits(ctx: &Context, target: &str) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    print_json(&ctx.backend.collect_wait_events(&config).await?)
}

pub async fn sessions(ctx: &Context, target: &str) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    print_json(&ctx.backend.collect_active_sessions(&config).await?)
}

pub async fn plan(
    ctx: &Context,
    target: &str,
    sql_id: &str,
    plan_hash: Option<i64>,
) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    let steps = ctx
        .backend
        .collect_execution_plan(&config, sql_id, plan_hash)
        .await?;
    if steps.is_empty() {
        anyhow::bail!("no plan found for sql_id {sql_id}");
    }
    print_json(&steps)
}

pub async fn sql_text(ctx: &Context, target: &str, sql_id: &str) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    match ctx.backend.get_sql_full_text(&config, sql_id).await? {
        Some(text) => print_json(&text),
        None => anyhow::bail!("sql_id {sql_id} is not in the shared pool"),
    }
}
