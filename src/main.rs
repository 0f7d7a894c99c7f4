use clap::{Arg, Command};
use log::LevelFilter;
use outreach_mailer::bounce::{self, BounceSource, ImapBounceSource};
use outreach_mailer::dispatch::{self, RunContext, RunOptions, RunSettings};
use outreach_mailer::{
    load_contacts, Config, LedgerStats, LocalClock, MessageComposer, SendLedger, SmtpTransport,
};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("outreach-mailer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sends a daily, warm-up limited batch of personalized outreach emails")
        .long_about(
            "Outreach Mailer - sends personalized emails to a CSV contact list:\n\
             • only inside a configured daily sending window\n\
             • with a per-run limit that ramps up as sending history grows\n\
             • never twice to the same address, even across interrupted runs\n\
             • reconciling bounce notifications and retrying earlier failures",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("outreach.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and contact source, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show sent/failed ledger statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-bounces")
                .long("check-bounces")
                .help("Reconcile bounce notifications into the ledger and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("preview")
                .long("preview")
                .value_name("ADDRESS")
                .help("Print the message that would be sent to a contact")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("no-wait")
                .long("no-wait")
                .help("Skip new sends instead of waiting when outside the sending window")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("outreach.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config.with_env_credentials(),
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("stats") {
        let ledger = open_ledger(&config);
        LedgerStats::from_ledger(&ledger, &config.warmup).print();
        return;
    }

    if let Some(address) = matches.get_one::<String>("preview") {
        preview(&config, address);
        return;
    }

    if matches.get_flag("check-bounces") {
        check_bounces(&config).await;
        return;
    }

    log::info!("🚀 Starting outreach run...");
    let options = RunOptions {
        wait_for_window: !matches.get_flag("no-wait"),
    };
    match run_outreach(&config, options).await {
        Ok(summary) => println!("\n🎉 DONE: {summary}"),
        Err(e) => {
            log::error!("Outreach run aborted: {e:#}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
            println!("Credentials are read from EMAIL_USER and EMAIL_PASS (or a .env file).");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn open_ledger(config: &Config) -> SendLedger {
    match SendLedger::load(&config.files.sent_log, &config.files.failed_log) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("❌ Failed to load ledger: {:#}", anyhow::Error::from(e));
            process::exit(1);
        }
    }
}

fn build_composer(config: &Config) -> anyhow::Result<MessageComposer> {
    let sender_address = config
        .sender_address()
        .unwrap_or_else(|| "sender@example.invalid".to_string());
    MessageComposer::new(&config.sender.display_name, &sender_address, &config.message)
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Sending window: {}", config.schedule.window());
    println!(
        "Warm-up: base {}, +{} per day, ceiling {}",
        config.warmup.base_limit, config.warmup.per_day_increment, config.warmup.absolute_ceiling
    );
    println!("SMTP: {}:{}", config.smtp.host, config.smtp.port);
    if config.bounce_check.enabled {
        println!(
            "Bounce check: {}:{} ({})",
            config.bounce_check.host, config.bounce_check.port, config.bounce_check.mailbox
        );
    } else {
        println!("Bounce check: disabled");
    }
    match config.require_credentials() {
        Ok(credentials) => println!("Credentials: {}", credentials.address),
        Err(e) => println!("⚠️ {e}"),
    }

    match load_contacts(&config.files.contacts, &config.contacts) {
        Ok(contacts) => println!("Contacts: {} rows", contacts.len()),
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {:#}", anyhow::Error::from(e));
            process::exit(1);
        }
    }
    if let Err(e) = build_composer(config) {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(1);
    }
    println!("✅ Configuration validated");
}

fn preview(config: &Config, address: &str) {
    let contacts = match load_contacts(&config.files.contacts, &config.contacts) {
        Ok(contacts) => contacts,
        Err(e) => {
            eprintln!("❌ {:#}", anyhow::Error::from(e));
            process::exit(1);
        }
    };
    let key = outreach_mailer::address::normalize(address);
    let Some(contact) = contacts.iter().find(|c| c.key() == key) else {
        eprintln!("❌ No contact with address {address}");
        process::exit(1);
    };
    let composer = match build_composer(config) {
        Ok(composer) => composer,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    };

    let email = composer.compose(contact);
    println!("From: {} <{}>", email.from_name, email.from_address);
    println!("To: {}", email.to);
    println!("Subject: {}", email.subject);
    println!();
    println!("{}", email.text);
}

fn bounce_source(config: &Config) -> Option<Arc<dyn BounceSource>> {
    if !config.bounce_check.enabled {
        return None;
    }
    let credentials = config.credentials.as_ref()?;
    Some(Arc::new(ImapBounceSource::new(
        config.bounce_check.clone(),
        &credentials.address,
        &credentials.secret,
    )))
}

async fn check_bounces(config: &Config) {
    let Some(source) = bounce_source(config) else {
        eprintln!("❌ Bounce check needs bounce_check.enabled and credentials");
        process::exit(1);
    };
    let mut ledger = open_ledger(config);

    let bounces = match bounce::scan_for_bounces(source).await {
        Ok(bounces) => bounces,
        Err(e) => {
            eprintln!("❌ Bounce check failed: {e}");
            process::exit(1);
        }
    };
    let reconciled = bounce::reconcile(&mut ledger, &bounces);
    if let Err(e) = ledger.persist() {
        eprintln!("❌ Failed to save ledger: {:#}", anyhow::Error::from(e));
        process::exit(1);
    }
    println!(
        "📮 Detected {} bounces, removed {} from the sent log",
        bounces.len(),
        reconciled.len()
    );
}

async fn run_outreach(
    config: &Config,
    options: RunOptions,
) -> anyhow::Result<outreach_mailer::RunSummary> {
    use anyhow::Context;

    let credentials = config.require_credentials()?;
    let contacts = load_contacts(&config.files.contacts, &config.contacts)?;
    let ledger = SendLedger::load(&config.files.sent_log, &config.files.failed_log)?;
    let transport = SmtpTransport::new(&config.smtp, &credentials.address, &credentials.secret)
        .context("Invalid SMTP configuration")?;
    let composer = build_composer(config)?;

    let ctx = RunContext::new(
        RunSettings::from_config(config),
        ledger,
        Box::new(transport),
        composer,
        Box::new(LocalClock),
    );
    dispatch::run(ctx, &contacts, bounce_source(config), options).await
}
