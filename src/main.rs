use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod api;
mod config;
mod criteria;
mod db;
mod eligibility;
mod error;
mod executor;
mod history;
mod memory;
mod models;
mod progression;
mod report;
mod seed;
mod store;
mod wizard;

use config::Config;
use db::PgStore;
use memory::MemoryStore;
use models::{BulkPromotionRequest, HistoryFilter};
use store::PromotionStore;

#[derive(Parser)]
#[command(name = "school-promotions")]
#[command(about = "End-of-year student promotion workflow for schools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the demo school
    Seed,
    /// Run the HTTP API
    Serve {
        /// Serve an in-memory copy of the demo school instead of Postgres
        #[arg(long)]
        ephemeral: bool,
    },
    /// List promotion criteria
    Criteria {
        #[arg(long, default_value = "demo")]
        school: String,
    },
    /// Evaluate eligibility for an academic year
    Preview {
        #[arg(long, default_value = "demo")]
        school: String,
        /// Academic year name or id; defaults to the current year
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        term: Option<String>,
        #[arg(long)]
        criteria: Option<Uuid>,
    },
    /// Derive class progression rules from grades and classes
    Progression {
        #[arg(long, default_value = "demo")]
        school: String,
        /// Store the derived rules
        #[arg(long)]
        save: bool,
    },
    /// Promote every eligible student using the saved progression rules
    Promote {
        #[arg(long, default_value = "demo")]
        school: String,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        promoted_by: String,
        /// Must be CONFIRM
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Render promotion history
    History {
        #[arg(long, default_value = "demo")]
        school: String,
        /// Filter by the academic year students were promoted out of
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        student: Option<String>,
        #[arg(long, value_enum, default_value_t = HistoryFormat::Markdown)]
        format: HistoryFormat,
        #[arg(long, default_value = "promotion-history.md")]
        out: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HistoryFormat {
    Markdown,
    Csv,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&config).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Serve { ephemeral } => {
            let store: Arc<dyn PromotionStore> = if ephemeral {
                Arc::new(MemoryStore::seeded()?)
            } else {
                Arc::new(PgStore::new(connect(&config).await?))
            };
            serve(store, &config).await?;
        }
        command => {
            let store = PgStore::new(connect(&config).await?);
            run(&store, &config, command).await?;
        }
    }

    Ok(())
}

async fn serve(store: Arc<dyn PromotionStore>, config: &Config) -> anyhow::Result<()> {
    let app = api::router(api::AppState::new(store, config.fee_lookup_concurrency));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "promotion API listening");
    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}

async fn run(store: &dyn PromotionStore, config: &Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Criteria { school } => {
            let school = store.school_by_code(&school).await?;
            let records = criteria::list(store, school.id).await?;
            if records.is_empty() {
                println!("No promotion criteria for {}.", school.name);
                return Ok(());
            }

            println!("Promotion criteria for {}:", school.name);
            for record in &records {
                let mut flags = Vec::new();
                if record.is_active {
                    flags.push("active");
                }
                if record.is_default {
                    flags.push("default");
                }
                println!(
                    "- {} [{}] min grade {:.1}, max balance {:.2}, max cases {} {}",
                    record.name,
                    record.id,
                    record.min_grade,
                    record.max_fee_balance,
                    record.max_disciplinary_cases,
                    if flags.is_empty() {
                        String::new()
                    } else {
                        format!("({})", flags.join(", "))
                    }
                );
            }
        }
        Commands::Preview {
            school,
            year,
            term,
            criteria: criteria_id,
        } => {
            let school = store.school_by_code(&school).await?;
            let year = store::resolve_year(store, school.id, year.as_deref()).await?;
            let rules = match criteria_id {
                Some(id) => store.get_criteria(school.id, id).await?,
                None => criteria::active(store, school.id).await?,
            };
            let report = eligibility::evaluate_roster(
                store,
                school.id,
                year.id,
                term.as_deref(),
                &rules,
                config.fee_lookup_concurrency,
            )
            .await?;

            println!("{} {} using \"{}\":", school.name, year.name, rules.name);
            println!("Eligible ({}):", report.eligible.len());
            for student in &report.eligible {
                println!(
                    "- {} ({}) avg {:.1}, balance {:.2}",
                    student.student_name,
                    student.current_class,
                    student.average_grade,
                    student.fee_balance
                );
            }
            println!("Ineligible ({}):", report.ineligible.len());
            for student in &report.ineligible {
                println!(
                    "- {} ({}): {}",
                    student.student_name,
                    student.current_class,
                    student.reason.as_deref().unwrap_or("not eligible")
                );
            }
        }
        Commands::Progression { school, save } => {
            let school = store.school_by_code(&school).await?;
            let derived = progression::derive(store, school.id).await?;

            for rule in &derived.rules {
                println!("- {} -> {}", rule.from_class, rule.to_class);
            }
            if !derived.missing.is_empty() {
                println!("Classes to create: {}", derived.missing.join(", "));
            }

            if save {
                let current = progression::load(store, school.id).await?;
                let map =
                    progression::save(store, school.id, &derived.rules, Some(current.version)).await?;
                println!("Saved {} rules (version {}).", map.rules.len(), map.version);
            }
        }
        Commands::Promote {
            school,
            year,
            promoted_by,
            confirm,
        } => {
            if confirm.as_deref() != Some(wizard::CONFIRMATION_TEXT) {
                anyhow::bail!(
                    "pass --confirm {} to promote students",
                    wizard::CONFIRMATION_TEXT
                );
            }

            let school = store.school_by_code(&school).await?;
            let year = store::resolve_year(store, school.id, year.as_deref()).await?;
            let rules = criteria::active(store, school.id).await?;
            let map = progression::load(store, school.id).await?;
            if map.rules.is_empty() {
                anyhow::bail!("no progression rules saved; run `progression --save` first");
            }

            let preview = eligibility::preview(
                store,
                school.id,
                year.id,
                None,
                &rules,
                config.fee_lookup_concurrency,
            )
            .await?;
            let (students, left_behind) = executor::assemble(
                &preview.eligible_students,
                &preview.ineligible_students,
                &BTreeMap::new(),
                &BTreeMap::new(),
                &map,
            )?;

            let request = BulkPromotionRequest {
                students,
                ineligible_students: left_behind,
                promoted_by: Some(promoted_by),
                academic_year_id: Some(year.id),
                snapshot_id: Some(preview.snapshot_id),
                term: None,
            };
            let result =
                executor::execute(store, &school, &request, config.fee_lookup_concurrency).await?;

            println!(
                "Promoted {}, excluded {}, skipped {}, errors {}.",
                result.promoted.len(),
                result.excluded.len(),
                result.skipped.len(),
                result.errors.len()
            );
            for failure in &result.errors {
                println!("- {}: {}", failure.student_id, failure.error);
            }
        }
        Commands::History {
            school,
            year,
            student,
            format,
            out,
        } => {
            let school = store.school_by_code(&school).await?;
            let filter = HistoryFilter {
                academic_year: year,
                student_id: student,
            };
            let logs = history::list(store, school.id, &filter).await?;

            match format {
                HistoryFormat::Markdown => {
                    let report = report::build_report(&school, &filter, &logs);
                    std::fs::write(&out, report)?;
                }
                HistoryFormat::Csv => {
                    let file = std::fs::File::create(&out)
                        .with_context(|| format!("failed to create {}", out.display()))?;
                    report::write_csv(file, &logs)?;
                }
            }
            println!("History for {} written to {}.", school.name, out.display());
        }
        Commands::InitDb | Commands::Seed | Commands::Serve { .. } => {}
    }

    Ok(())
}
