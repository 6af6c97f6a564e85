//! Queue statistics (`buildforge stats`).

use anyhow::Result;

use buildforge::config::Config;
use buildforge::queue::JobQueue;
use buildforge::runtime::open_database;
use buildforge::store::DbHandle;

pub async fn cmd_stats(config: Config, user: &str, json: bool) -> Result<()> {
    let db = DbHandle::new(open_database(&config)?);
    let queue = JobQueue::new(db, config.queue.clone());
    let stats = queue.stats(user).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Jobs");
    println!("  waiting:   {}", stats.waiting);
    println!("  active:    {}", stats.active);
    println!("  completed: {}", stats.completed);
    println!("  failed:    {}", stats.failed);
    println!();
    println!("Active builds for {}: {}", user, stats.user_active_builds);
    match stats.avg_duration_ms {
        Some(avg) => println!(
            "Average build time: {:.1}s over the last {} build(s)",
            avg / 1000.0,
            stats.sample_size
        ),
        None => println!("Average build time: no finished builds yet"),
    }
    Ok(())
}
