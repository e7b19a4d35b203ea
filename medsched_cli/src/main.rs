use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use medsched_core::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "medsched")]
#[command(about = "Pet medication scheduling and dosage progression", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a medication plan from a JSON file
    Add {
        /// Path to the schedule JSON
        file: PathBuf,
    },

    /// List stored medication plans
    List,

    /// Schedule the next dose of one medication
    Next {
        id: MedicationId,

        /// Reference date (YYYY-MM-DD), defaults to the local date
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Schedule every active auto-scheduled medication
    Sweep {
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Show upcoming doses without scheduling anything
    Preview {
        id: MedicationId,

        /// Number of doses to show
        #[arg(long, default_value_t = 5)]
        count: usize,

        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Export all reminders to CSV for calendar import
    Export {
        /// Output file, defaults to reminders.csv in the data directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

type Orchestrator = ScheduleOrchestrator<JsonScheduleStore, JsonlReminderSink>;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        medsched_core::logging::init_with_level("debug");
    } else {
        medsched_core::logging::init_with_level("warn");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_configuration() {
                eprintln!("  Fix the medication plan and run again.");
            } else if matches!(e, Error::SchedulingFailed { .. }) {
                eprintln!("  Nothing was scheduled; it is safe to retry.");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    match cli.command {
        Commands::Add { file } => cmd_add(&config, &file),
        Commands::List => cmd_list(&config),
        Commands::Next { id, today } => cmd_next(&config, id, resolve_today(today)),
        Commands::Sweep { today } => cmd_sweep(&config, resolve_today(today)),
        Commands::Preview { id, count, today } => {
            cmd_preview(&config, id, count, resolve_today(today))
        }
        Commands::Export { output } => cmd_export(&config, output),
    }
}

fn resolve_today(today: Option<NaiveDate>) -> NaiveDate {
    today.unwrap_or_else(|| chrono::Local::now().date_naive())
}

fn schedule_store(config: &Config) -> JsonScheduleStore {
    JsonScheduleStore::new(config.schedules_dir(), config.lock_timeout())
}

fn reminder_sink(config: &Config) -> JsonlReminderSink {
    JsonlReminderSink::new(config.reminders_path(), config.lock_timeout())
}

fn orchestrator(config: &Config) -> Orchestrator {
    ScheduleOrchestrator::new(schedule_store(config), reminder_sink(config))
        .with_retry_policy(config.retry_policy())
}

fn cmd_add(config: &Config, file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(file)?;
    let schedule: MedicationSchedule = serde_json::from_str(&contents)?;

    // Reject plans that could never be scheduled
    let rule = schedule.periodicity_rule()?;
    dosage_at_index(&schedule.dosage, &schedule.progression_rule(), 1)?;

    let saved = schedule_store(config).save_plan(&schedule)?;
    println!("✓ Saved {} (medication {})", saved.name, saved.id);
    println!("  Periodicity: {}", rule);
    println!("  Dosage: {}", saved.dosage);
    println!("  Doses scheduled so far: {}", saved.current_dose_count);
    Ok(())
}

fn cmd_list(config: &Config) -> Result<()> {
    let plans = schedule_store(config).list()?;

    if plans.is_empty() {
        println!("No medication plans in {}", config.schedules_dir().display());
        return Ok(());
    }
    for plan in plans {
        let rule = plan
            .periodicity_rule()
            .map(|rule| rule.to_string())
            .unwrap_or_else(|e| format!("invalid ({})", e));
        let state = if !plan.is_active {
            "closed"
        } else if plan.auto_schedule {
            "auto"
        } else {
            "manual"
        };
        println!(
            "{:<4} {:<16} {:<24} {:<10} {} doses, {}",
            plan.id, plan.name, rule, plan.dosage, plan.current_dose_count, state
        );
    }
    Ok(())
}

fn cmd_next(config: &Config, id: MedicationId, today: NaiveDate) -> Result<()> {
    tracing::info!("Scheduling medication {} as of {}", id, today);
    let dose = orchestrator(config).schedule_next(id, today)?;

    if dose.newly_scheduled {
        println!("✓ Scheduled dose {} of medication {}", dose.dose_index, id);
    } else {
        println!("Already scheduled: dose {} of medication {}", dose.dose_index, id);
    }
    println!("  Date: {}", dose.next_date);
    println!("  Dosage: {}", dose.dosage);
    Ok(())
}

fn cmd_sweep(config: &Config, today: NaiveDate) -> Result<()> {
    tracing::info!("Sweeping auto-scheduled medications as of {}", today);
    let report = orchestrator(config).sweep(today)?;

    for dose in &report.scheduled {
        let marker = if dose.newly_scheduled { "✓" } else { "=" };
        println!(
            "{} medication {}: {} {}",
            marker, dose.medication_id, dose.next_date, dose.dosage
        );
    }
    for id in &report.closed {
        println!("- medication {}: closed", id);
    }
    for (id, e) in &report.failed {
        println!("✗ medication {}: {}", id, e);
    }

    println!(
        "\n{} scheduled ({} new), {} closed, {} failed",
        report.scheduled.len(),
        report.newly_scheduled(),
        report.closed.len(),
        report.failed.len()
    );

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "{} medication(s) could not be scheduled",
            report.failed.len()
        )))
    }
}

fn cmd_preview(config: &Config, id: MedicationId, count: usize, today: NaiveDate) -> Result<()> {
    let doses = orchestrator(config).preview(id, today, count)?;

    if doses.is_empty() {
        println!("No upcoming doses for medication {}", id);
        return Ok(());
    }
    for dose in doses {
        let marker = if dose.target_reached { "  (target reached)" } else { "" };
        println!("#{:<4} {}  {}{}", dose.dose_index, dose.date, dose.dosage, marker);
    }
    Ok(())
}

fn cmd_export(config: &Config, output: Option<PathBuf>) -> Result<()> {
    let csv_path = output.unwrap_or_else(|| config.calendar_csv_path());
    let count = export_reminders_csv(&reminder_sink(config), &csv_path)?;

    println!("✓ Exported {} reminders", count);
    println!("  CSV: {}", csv_path.display());
    Ok(())
}
