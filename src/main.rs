use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Arg, ArgAction, Command};
use cmmsnotify::app::FirebaseApp;
use cmmsnotify::config::Settings;
use cmmsnotify::functions::{Job, run_job, schedules};
use cmmsnotify::set_up_logger;
use log::{debug, info};

#[derive(Debug)]
struct Args {
    verbose: bool,
    job: Job,
    now: Option<DateTime<Utc>>,
    print_schedules: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let matches = Command::new("cmmsnotify")
        .version("0.1")
        .author("Jacob Luszcz")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose mode. Outputs DEBUG and higher log messages."),
        )
        .arg(
            Arg::new("job")
                .short('j')
                .long("job")
                .value_parser(["check", "cleanup"])
                .default_value("check")
                .help("Job to run once: send due reminders, or delete old triggered ones."),
        )
        .arg(
            Arg::new("now")
                .short('n')
                .long("now")
                .env("CMMS_NOW")
                .help("Run as if the current time were this RFC 3339 timestamp."),
        )
        .arg(
            Arg::new("schedules")
                .short('s')
                .long("schedules")
                .action(ArgAction::SetTrue)
                .help("Print the cron schedules for each job and exit."),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");

    let job = match matches.get_one::<String>("job").map(String::as_str) {
        Some("cleanup") => Job::CleanupOldNotifications,
        _ => Job::CheckNotifications,
    };

    let now = matches
        .get_one::<String>("now")
        .map(|s| DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .context("Invalid --now")?;

    let print_schedules = matches.get_flag("schedules");

    Ok(Args {
        verbose,
        job,
        now,
        print_schedules,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    set_up_logger(module_path!(), args.verbose)?;
    debug!("{args:?}");

    if args.print_schedules {
        let schedules = schedules(&Settings::from_env()?);
        println!("{}", serde_json::to_string_pretty(&schedules)?);
        return Ok(());
    }

    let app = FirebaseApp::from_env().await?;
    let now = args.now.unwrap_or_else(Utc::now);

    let result = run_job(&app, args.job, now).await?;
    info!("{result}");

    Ok(())
}
