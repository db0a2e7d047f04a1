#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planwright::cache::{request_hash, SqliteResponseCache};
use planwright::gateway::{ChatGateway, ProviderGateway, TracingUsageSink};
use planwright::pipeline::{GenerationPipeline, PipelineConfig, DEFAULT_MODEL};
use planwright::prompts::{self, PromptContext, TemplateId};
use planwright::reconcile::{TaskPriority, TaskRecord, TaskStatus};
use planwright::schedule::WorkingHours;
use planwright::{decompose, schedule, tasks};

#[derive(Parser)]
#[command(name = "planwright", version, about = "Planwright task generation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GenerationOpts {
    /// SQLite cache file (defaults to PLANWRIGHT_CACHE_PATH or .planwright_cache.sqlite)
    #[arg(long)]
    db: Option<PathBuf>,
    /// Skip the response cache entirely
    #[arg(long)]
    no_cache: bool,
    /// Model id (defaults to OPENAI_MODEL)
    #[arg(long)]
    model: Option<String>,
    /// Principal recorded in audit logs and cache rows
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export SQLite cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_minutes: Option<i64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Render a prompt template without calling the backend
    Prompt {
        /// Template slug (create, update, decompose, plan, ...)
        #[arg(long)]
        template: String,
        /// JSON object with the template variables
        #[arg(long)]
        context: Option<PathBuf>,
        /// Model the cache key is computed for (defaults to OPENAI_MODEL)
        #[arg(long)]
        model: Option<String>,
    },
    /// Turn a free-form request into new tasks and updates
    Generate {
        #[arg(long)]
        request: String,
        /// JSON array of existing tasks
        #[arg(long)]
        tasks: Option<PathBuf>,
        #[command(flatten)]
        opts: GenerationOpts,
    },
    /// Break a task into subtasks
    Decompose {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Extra constraints for the breakdown
        #[arg(long)]
        requirements: Option<String>,
        #[command(flatten)]
        opts: GenerationOpts,
    },
    /// Lay tasks out in a daily schedule
    Plan {
        #[arg(long)]
        request: String,
        /// JSON array of tasks to schedule
        #[arg(long)]
        tasks: PathBuf,
        /// Working hours as HH:MM-HH:MM
        #[arg(long, default_value = "09:00-18:00")]
        hours: String,
        #[command(flatten)]
        opts: GenerationOpts,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planwright=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteResponseCache::default_path);
            let cache = SqliteResponseCache::new(path)?;
            let written = cache.export_jsonl(out).await?;
            eprintln!("exported {written} rows");
        }
        Commands::CachePrune {
            db,
            max_age_minutes,
            max_rows,
        } => {
            if max_age_minutes.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-minutes and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            if matches!(max_age_minutes, Some(m) if m < 0) {
                return Err("--max-age-minutes must be >= 0".into());
            }
            let path = db.unwrap_or_else(SqliteResponseCache::default_path);
            let cache = SqliteResponseCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_minutes, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
        Commands::Prompt {
            template,
            context,
            model,
        } => {
            let template = TemplateId::from_slug(&template)?;
            let context = match context {
                Some(path) => PromptContext::from_json(read_json(&path)?)?,
                None => PromptContext::new(),
            };
            let model = model
                .or_else(|| std::env::var("OPENAI_MODEL").ok())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let prompt = prompts::render(template, &context);
            eprintln!("request hash {}", request_hash(&prompt.text, &model));
            println!("{}", prompt.text);
        }
        Commands::Generate {
            request,
            tasks: tasks_path,
            opts,
        } => {
            let existing: Vec<TaskRecord> = match tasks_path {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let pipeline = build_pipeline(&opts)?;
            let result = tasks::generate_tasks(
                &pipeline,
                &request,
                &existing,
                opts.owner.as_deref(),
                Utc::now(),
            )
            .await?;
            print_json(&result)?;
        }
        Commands::Decompose {
            title,
            description,
            priority,
            requirements,
            opts,
        } => {
            let priority = TaskPriority::parse(&priority)
                .ok_or_else(|| format!("unknown priority '{priority}'"))?;
            let now = Utc::now();
            let parent = TaskRecord {
                id: 0,
                title,
                description,
                status: TaskStatus::Pending,
                priority,
                planned_date: None,
                planned_start_time: None,
                planned_end_time: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            let pipeline = build_pipeline(&opts)?;
            let result = decompose::decompose_task(
                &pipeline,
                &parent,
                requirements.as_deref(),
                opts.owner.as_deref(),
                now,
            )
            .await?;
            print_json(&result)?;
        }
        Commands::Plan {
            request,
            tasks: tasks_path,
            hours,
            opts,
        } => {
            let hours: WorkingHours = hours.parse()?;
            let task_list: Vec<TaskRecord> = read_json(&tasks_path)?;
            let pipeline = build_pipeline(&opts)?;
            let plan =
                schedule::plan_day(&pipeline, &request, &task_list, hours, opts.owner.as_deref())
                    .await?;
            print_json(&plan)?;
        }
    }

    Ok(())
}

fn build_pipeline(opts: &GenerationOpts) -> Result<GenerationPipeline, Box<dyn std::error::Error>> {
    let gateway: Arc<dyn ChatGateway> =
        Arc::new(ProviderGateway::from_env(Arc::new(TracingUsageSink))?);

    let mut config = PipelineConfig::from_env();
    if let Some(model) = &opts.model {
        config.model = model.clone();
    }
    config.cache_path = if opts.no_cache {
        None
    } else {
        opts.db.clone().or(config.cache_path)
    };

    Ok(GenerationPipeline::from_config(gateway, config)?)
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
