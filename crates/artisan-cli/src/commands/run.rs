//! Run configured jobs through the job queue.

use anyhow::{Context, Result};
use artisan_config::{BuildSettings, ProjectConfig, load_project};
use artisan_core::{BuildTrigger, ScriptJob, Worker};
use artisan_scheduler::{BuildResult, Builder, BuilderConfig, JobQueue};
use std::sync::Arc;
use tracing::warn;

use crate::workers;

/// Run the selected jobs (all of them when `names` is empty).
///
/// Returns whether every build succeeded.
pub async fn run(config_path: &str, names: &[String], trigger: &str) -> Result<bool> {
    let project = load_project(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;
    let trigger: BuildTrigger = trigger.parse()?;
    let jobs = select_jobs(&project, names)?;
    if jobs.is_empty() {
        anyhow::bail!("Project '{}' has no jobs", project.name);
    }

    println!("Running project: {}", project.name);
    println!("Jobs: {}", jobs.len());

    let mut connected: Vec<Arc<dyn Worker>> = Vec::new();
    if project.workers.is_empty() {
        connected.push(Arc::new(artisan_worker::LocalWorker::new()?));
    }
    for entry in &project.workers {
        match workers::connect(entry).await {
            Ok(worker) => {
                println!("Worker '{}' ready on {}", entry.name, worker.host());
                connected.push(worker);
            }
            Err(e) => warn!(worker = %entry.name, error = %e, "Worker unavailable, skipping"),
        }
    }
    if connected.is_empty() {
        anyhow::bail!("No configured worker could be reached");
    }

    let builder = Arc::new(Builder::new(builder_config(&project.builds, trigger)));
    let queue = JobQueue::new(builder);
    for worker in &connected {
        queue.add_worker(worker.clone());
    }
    for job in jobs {
        queue.add_job(Arc::new(job));
    }

    println!("\n--- Starting builds ---\n");
    let (results, stranded) = await_builds(&queue).await;
    print_summary(&results);
    if stranded > 0 {
        println!("✗ {} job(s) never ran: no worker left to run them", stranded);
    }

    for worker in connected {
        if worker.closed() {
            continue;
        }
        if let Err(e) = worker.close().await {
            warn!(worker = worker.host(), error = %e, "Failed to close worker");
        }
    }

    Ok(stranded == 0 && results.iter().all(|r| r.success))
}

/// Wait until no worker is busy, then collect the finished builds and count
/// the jobs still waiting. Waiting jobs remain only when every worker closed.
pub async fn await_builds(queue: &JobQueue) -> (Vec<BuildResult>, usize) {
    queue.wait(None).await;
    (queue.take_results(), queue.idle_jobs())
}

/// Jobs named on the command line, in the order given, or every job.
pub fn select_jobs(project: &ProjectConfig, names: &[String]) -> Result<Vec<ScriptJob>> {
    if names.is_empty() {
        return Ok(project.jobs.clone());
    }
    names
        .iter()
        .map(|name| Ok(project.job(name)?.clone()))
        .collect()
}

pub fn builder_config(settings: &BuildSettings, trigger: BuildTrigger) -> BuilderConfig {
    BuilderConfig {
        trigger,
        build_root: settings.root.clone(),
        keep_build_dir: settings.keep,
        step_timeout: settings.step_timeout,
    }
}

fn print_summary(results: &[BuildResult]) {
    println!("\n--- Build Summary ---");
    for result in results {
        let seconds = result.duration().num_milliseconds() as f64 / 1000.0;
        if result.success {
            println!("  ✓ {} on {} ({:.1}s)", result.job, result.worker, seconds);
        } else {
            let step = result
                .failed_step
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "  ✗ {} on {} failed in {}: {} ({:.1}s)",
                result.job,
                result.worker,
                step,
                result.error.as_deref().unwrap_or("no error recorded"),
                seconds
            );
        }
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed == 0 {
        println!("\n✓ All {} build(s) succeeded", results.len());
    } else {
        println!("\n✗ {} of {} build(s) failed", failed, results.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisan_config::parse_project;
    use std::time::Duration;

    const PROJECT: &str = r#"
project "demo"
builds root="/var/artisan" keep=#true step-timeout=30
job "lint" {
    script "cargo clippy"
}
job "test" {
    script "cargo test"
}
"#;

    #[test]
    fn test_select_all_jobs() {
        let project = parse_project(PROJECT).unwrap();
        let jobs = select_jobs(&project, &[]).unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["lint", "test"]);
    }

    #[test]
    fn test_select_named_jobs_in_given_order() {
        let project = parse_project(PROJECT).unwrap();
        let jobs = select_jobs(&project, &["test".to_string(), "lint".to_string()]).unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["test", "lint"]);
    }

    #[test]
    fn test_select_unknown_job_fails() {
        let project = parse_project(PROJECT).unwrap();
        assert!(select_jobs(&project, &["deploy".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_jobs_left_without_workers_are_counted() {
        let project = parse_project(PROJECT).unwrap();
        let queue = JobQueue::new(Arc::new(Builder::new(BuilderConfig::default())));

        let worker = artisan_worker::LocalWorker::new().unwrap();
        worker.close().await.unwrap();
        queue.add_worker(Arc::new(worker));
        for job in select_jobs(&project, &[]).unwrap() {
            queue.add_job(Arc::new(job));
        }

        let (results, stranded) = await_builds(&queue).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].job, "lint");
        assert_eq!(stranded, 1);
    }

    #[test]
    fn test_builder_config_from_settings() {
        let project = parse_project(PROJECT).unwrap();
        let config = builder_config(&project.builds, BuildTrigger::Push);
        assert_eq!(config.trigger, BuildTrigger::Push);
        assert_eq!(config.build_root.as_deref(), Some("/var/artisan"));
        assert!(config.keep_build_dir);
        assert_eq!(config.step_timeout, Some(Duration::from_secs(30)));
    }
}
