// CLI commands for talking to a Crucible deployment
use anyhow::{bail, Context, Result};
use crucible_common::config::QueueSettings;
use crucible_common::languages::LanguageConfigManager;
use crucible_common::redis::{self, JobEnvelope, JobState};
use crucible_common::types::{JobResult, Language, Submission};
use ::redis::aio::ConnectionManager;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

async fn connect(settings: &QueueSettings) -> Result<ConnectionManager> {
    let client = ::redis::Client::open(settings.redis_url.as_str())
        .context("Invalid REDIS_URL")?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))
}

/// Read and sanity-check a submission file
fn load_submission(path: &Path) -> Result<Submission> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let submission: Submission = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    // The worker rejects these too, but failing here saves a round trip
    submission.language.parse::<Language>()?;
    if submission.test_cases.is_empty() {
        bail!("Submission has no test cases");
    }
    Ok(submission)
}

fn describe_result(result: &JobResult) -> String {
    match result {
        JobResult::Completed { summary, .. } => format!(
            "{:?}: {}/{} passed ({}%)",
            summary.status, summary.passed, summary.total_tests_executed, summary.percentage
        ),
        JobResult::Failed { error, total_tests, .. } => {
            format!("Error ({} test case(s) not run): {}", total_tests, error)
        }
    }
}

fn print_result(result: &JobResult) -> Result<()> {
    println!("\n📊 {}", describe_result(result));
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Enqueue a submission, optionally waiting for its result
pub async fn submit(file: &Path, wait: bool, timeout_secs: u64) -> Result<()> {
    let submission = load_submission(file)?;
    let settings = QueueSettings::from_env()?;
    let mut conn = connect(&settings).await?;

    let envelope = JobEnvelope::new(&submission)?;
    redis::push_job(&mut conn, &settings.queue_name, &envelope)
        .await
        .context("Failed to enqueue submission")?;

    println!("🚀 Submitted {} job {}", submission.language, envelope.id);
    println!("   Queue: {}", redis::queue_key(&settings.queue_name));

    if !wait {
        println!("\n💡 Check it with: crucible-cli status {}", envelope.id);
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let mut last_progress = None;
    loop {
        if let Some(result) = redis::get_result(&mut conn, &envelope.id).await? {
            return print_result(&result);
        }

        let progress = redis::get_progress(&mut conn, &envelope.id).await?;
        if progress.is_some() && progress != last_progress {
            println!("⏳ {}%", progress.unwrap_or(0));
            last_progress = progress;
        }

        if Instant::now() >= deadline {
            bail!("No result for job {} after {}s", envelope.id, timeout_secs);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Show what Redis knows about a job
pub async fn status(id: Uuid) -> Result<()> {
    let settings = QueueSettings::from_env()?;
    let mut conn = connect(&settings).await?;

    let state = redis::get_state(&mut conn, &id).await?;
    let progress = redis::get_progress(&mut conn, &id).await?;

    match state {
        None => println!("❔ Job {} is queued, unknown or expired", id),
        Some(JobState::Active) => println!("⏳ Job {} is running ({}%)", id, progress.unwrap_or(0)),
        Some(state) => {
            println!("✅ Job {} is {:?}", id, state);
            if let Some(result) = redis::get_result(&mut conn, &id).await? {
                print_result(&result)?;
            }
        }
    }

    Ok(())
}

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let manager = LanguageConfigManager::load_or_builtin(config_path)?;

    if config_path.exists() {
        println!("📋 Configured Languages ({}):\n", config_path.display());
    } else {
        println!("📋 Built-in Languages ({} not found):\n", config_path.display());
    }
    println!("{:<12} {:<10} {:<24} {:<20} {:<30}",
             "Name", "Version", "Image", "Source", "Compile / Run");
    println!("{}", "─".repeat(100));

    for lang in manager.iter() {
        let commands = match &lang.compile {
            Some(compile) => format!("{} && {}", compile.join(" "), lang.run.join(" ")),
            None => lang.run.join(" "),
        };
        println!("{:<12} {:<10} {:<24} {:<20} {}",
                 lang.name.as_str(),
                 lang.version,
                 lang.image,
                 lang.source_path(),
                 commands);
    }

    println!("\n✅ Total: {} language(s)", manager.iter().count());

    Ok(())
}
