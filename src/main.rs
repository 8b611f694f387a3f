use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{Local, TimeZone};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{info, warn};
use waha_harvester::{
    fetch_with_retry,
    projection::{self, ContactDirectory},
    query::{self, ContactQuery, FileKind, MessageQuery, Summary, TimeFilter},
    store::{self, FileSink},
    ChatId, ConfigStore, FetchRequest, FetchResult, GatewayClient, GatewaySettings,
    HarvesterConfig, MessageSource, MockSource, Scheduler, SortOrder, DEFAULT_BASE_URL,
    DEFAULT_CHAT_ID,
};

/// Harvest chat messages from a WAHA gateway and flatten chat exports.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch one page of messages for a chat and save it.
    Fetch(FetchArgs),
    /// Fetch all enabled chats now and then on the configured interval.
    Schedule {
        /// Configuration file; created with defaults when missing.
        #[arg(long, default_value = "waha_config.json")]
        config: PathBuf,
        /// Override the interval in minutes.
        #[arg(long)]
        interval: Option<u64>,
        /// Run a single cycle and exit.
        #[arg(long)]
        test_run: bool,
        /// Use generated messages instead of the gateway.
        #[arg(long)]
        mock_data: bool,
    },
    /// Write a sample configuration file.
    InitConfig {
        #[arg(long, default_value = "waha_config.json")]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Project exported messages onto selected fields and append them.
    ProjectMessages {
        /// JSON array of exported messages. A bare file name is read from
        /// the export directory.
        input: PathBuf,
        #[arg(long, default_value = projection::MESSAGE_EXPORT_DIR)]
        export_dir: PathBuf,
        #[arg(short, long, default_value = "output/data_saya.json")]
        output: PathBuf,
        /// Comma-separated fields to keep.
        #[arg(long, default_value = projection::DEFAULT_FIELDS)]
        fields: String,
        /// Contact file used to add from_name / to_name.
        #[arg(long, default_value = "output/kontak_saya.json")]
        contacts: PathBuf,
        /// Print the projected records.
        #[arg(long)]
        pretty: bool,
        /// Print only; do not write the output file.
        #[arg(long)]
        terminal_only: bool,
    },
    /// Summarise a chat export into contact records and append them.
    ProjectChats {
        /// JSON array of exported chats. A bare file name is read from the
        /// export directory.
        input: PathBuf,
        #[arg(long, default_value = projection::CHAT_EXPORT_DIR)]
        export_dir: PathBuf,
        #[arg(short, long, default_value = "kontak_saya.json")]
        output: PathBuf,
    },
    /// Update contact names from a newer contact dump.
    RefreshContacts {
        #[arg(long, default_value = "response.json")]
        source: PathBuf,
        #[arg(long, default_value = "output/kontak_saya.json")]
        contacts: PathBuf,
        #[arg(long, default_value = "output/kontak_saya_updated.json")]
        output: PathBuf,
    },
    /// Search and page through saved contact files.
    Contacts(ContactsArgs),
    /// Filter and page through saved message files.
    Messages(MessagesArgs),
    /// Summarise saved contacts and messages.
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
struct ContactsArgs {
    #[arg(long, default_value = "output")]
    dir: PathBuf,
    /// Read only this file from the directory.
    #[arg(long)]
    file: Option<String>,
    /// Match against name, id and phone.
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value = "name")]
    sort: String,
    #[arg(long, value_enum, default_value_t = SortOrder::Asc)]
    order: SortOrder,
    #[arg(long, default_value_t = 100)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Comma-separated keys to keep.
    #[arg(long)]
    fields: Option<String>,
}

#[derive(Args, Debug)]
struct MessagesArgs {
    #[arg(long, default_value = "output")]
    dir: PathBuf,
    /// Read only this file from the directory.
    #[arg(long)]
    file: Option<String>,
    /// Messages sent by or to this id.
    #[arg(long)]
    contact: Option<String>,
    #[arg(long)]
    from_user: Option<String>,
    #[arg(long)]
    to_user: Option<String>,
    /// Match against body, message, from and to.
    #[arg(long)]
    search: Option<String>,
    /// Earliest message: YYYY-MM-DD, RFC 3339 or epoch seconds.
    #[arg(long)]
    since: Option<String>,
    /// Latest message; a bare date includes the whole day.
    #[arg(long)]
    until: Option<String>,
    #[arg(long)]
    has_media: Option<bool>,
    #[arg(long)]
    from_me: Option<bool>,
    #[arg(long, default_value = "timestamp")]
    sort: String,
    #[arg(long, value_enum, default_value_t = SortOrder::Asc)]
    order: SortOrder,
    #[arg(long, default_value_t = 100)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long, default_value = "output")]
    dir: PathBuf,
    /// Count only this message file.
    #[arg(long)]
    messages_file: Option<String>,
    /// Count only this contact file.
    #[arg(long)]
    contacts_file: Option<String>,
    /// Count only messages sent by or to this id.
    #[arg(long)]
    contact: Option<String>,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
}

#[derive(Args, Debug)]
struct FetchArgs {
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    url: String,
    #[arg(long, default_value = "admin")]
    username: String,
    #[arg(long, default_value = "change-me")]
    password: String,
    #[arg(long, default_value = "change-me")]
    api_key: String,
    /// Chat id, e.g. 628123456789@c.us.
    #[arg(long, default_value = DEFAULT_CHAT_ID)]
    chat_id: ChatId,
    /// Messages per request (1-1000).
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=1000))]
    limit: u32,
    /// Pagination offset: a multiple of 100 up to 1000.
    #[arg(long, default_value_t = 0, value_parser = parse_offset)]
    offset: u32,
    #[arg(long, default_value = "timestamp")]
    sort_by: String,
    #[arg(long, value_enum, default_value_t = SortOrder::Desc)]
    sort_order: SortOrder,
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
    /// Only test the connection to the gateway.
    #[arg(long)]
    test_connection: bool,
    /// Retry attempts for network failures.
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Seconds between retries.
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Use generated messages instead of the gateway.
    #[arg(long)]
    mock_data: bool,
}

fn parse_offset(raw: &str) -> Result<u32, String> {
    let offset: u32 = raw.parse().map_err(|e| format!("{e}"))?;
    if offset > 1000 || offset % 100 != 0 {
        return Err("offset must be one of 0, 100, ..., 1000".to_string());
    }
    Ok(offset)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Fetch(args) => run_fetch(args),
        Commands::Schedule {
            config,
            interval,
            test_run,
            mock_data,
        } => run_schedule(config, interval, test_run, mock_data),
        Commands::InitConfig { config, force } => {
            let config_store = ConfigStore::new(&config);
            if config.exists() && !force {
                return Err(format!("{} already exists; pass --force to overwrite", config.display()).into());
            }
            config_store.save(&HarvesterConfig::sample())?;
            println!("Sample configuration created: {}", config.display());
            Ok(())
        }
        Commands::ProjectMessages {
            input,
            export_dir,
            output,
            fields,
            contacts,
            pretty,
            terminal_only,
        } => {
            let fields = projection::parse_field_list(&fields);
            if fields.is_empty() {
                return Err("no recognised fields requested".into());
            }
            let directory = ContactDirectory::load(&contacts);
            let input = projection::resolve_input(&input, &export_dir);
            let records = projection::read_records(&input)?;
            info!("processing {} records from {}", records.len(), input.display());

            let projected: Vec<_> = records
                .iter()
                .map(|record| projection::project_message(record, &fields, Some(&directory)))
                .collect();

            if pretty || terminal_only {
                let shown = if terminal_only { projected.len() } else { projected.len().min(5) };
                println!("{}", serde_json::to_string_pretty(&projected[..shown])?);
                if shown < projected.len() {
                    println!("... and {} more items", projected.len() - shown);
                }
            }

            if terminal_only {
                println!("Terminal-only mode: no file saved");
            } else {
                let outcome = store::append_records(&output, &projected)?;
                println!(
                    "Saved {} new records to {} (total: {})",
                    outcome.added,
                    output.display(),
                    outcome.total
                );
            }
            Ok(())
        }
        Commands::ProjectChats {
            input,
            export_dir,
            output,
        } => {
            let input = projection::resolve_input(&input, &export_dir);
            let records = projection::read_records(&input)?;
            let summaries: Vec<_> = records.iter().filter_map(projection::project_chat).collect();
            if summaries.len() < records.len() {
                warn!("skipped {} chats without an id", records.len() - summaries.len());
            }
            let outcome = store::append_records(&output, &summaries)?;
            println!(
                "Processed {} contacts from {} (total in {}: {})",
                outcome.added,
                input.display(),
                output.display(),
                outcome.total
            );
            Ok(())
        }
        Commands::RefreshContacts {
            source,
            contacts,
            output,
        } => {
            let latest = projection::read_records(&source)?;
            let mut current = projection::read_records(&contacts)?;
            let updated = projection::refresh_contact_names(&mut current, &latest);
            store::write_array(&output, &current)?;
            println!("Updated {updated} of {} contacts; saved to {}", current.len(), output.display());
            Ok(())
        }
        Commands::Contacts(args) => run_contacts(args),
        Commands::Messages(args) => run_messages(args),
        Commands::Stats(args) => run_stats(args),
    }
}

fn run_contacts(args: ContactsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let records = query::load_records(&args.dir, FileKind::Contacts, args.file.as_deref())?;
    let page = ContactQuery {
        search: args.search,
        sort_by: args.sort,
        order: args.order,
        limit: args.limit,
        offset: args.offset,
        fields: args.fields.map(|list| {
            list.split(',')
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect()
        }),
    }
    .apply(records);
    info!("matched {} contacts, showing {}", page.total, page.count);
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

fn run_messages(args: MessagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let records = query::load_records(&args.dir, FileKind::Messages, args.file.as_deref())?;
    let page = MessageQuery {
        contact_id: args.contact,
        from_user: args.from_user,
        to_user: args.to_user,
        search: args.search,
        time: time_filter(args.since.as_deref(), args.until.as_deref())?,
        has_media: args.has_media,
        from_me: args.from_me,
        sort_by: args.sort,
        order: args.order,
        limit: args.limit,
        offset: args.offset,
    }
    .apply(records);
    info!("matched {} messages, showing {}", page.total, page.count);
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

fn run_stats(args: StatsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let contacts = query::load_records(&args.dir, FileKind::Contacts, args.contacts_file.as_deref())?;
    let messages = query::load_records(&args.dir, FileKind::Messages, args.messages_file.as_deref())?;

    let filter = MessageQuery {
        contact_id: args.contact,
        time: time_filter(args.since.as_deref(), args.until.as_deref())?,
        ..MessageQuery::default()
    };
    let selected = filter.filter(&messages);
    let directory = ContactDirectory::from_records(&contacts);

    let summary = Summary::new(
        query::file_stats(&args.dir)?,
        query::contact_stats(&contacts),
        query::message_stats(&selected, Some(&directory)),
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn time_filter(since: Option<&str>, until: Option<&str>) -> Result<TimeFilter, query::QueryError> {
    Ok(TimeFilter {
        start_ts: since.map(|raw| query::parse_date_bound(raw, false)).transpose()?,
        end_ts: until.map(|raw| query::parse_date_bound(raw, true)).transpose()?,
    })
}

fn run_fetch(args: FetchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = GatewaySettings::default()
        .with_base_url(args.url.clone())
        .with_credentials(args.username.clone(), args.password.clone())
        .with_api_key(args.api_key.clone())
        .with_timeout(Duration::from_secs(args.timeout));
    let client = GatewayClient::new(settings);

    if args.test_connection || !args.mock_data {
        let report = client.test_connection()?;
        if !report.is_reachable() {
            return Err(format!("connection test failed: HTTP {}", report.root_status).into());
        }
        println!("Server is reachable (HTTP {}).", report.root_status);
        if let Some(status) = report.probe_status {
            println!("Message endpoint answered HTTP {status}.");
        }
        if args.test_connection {
            return Ok(());
        }
    }

    let request = FetchRequest::new(args.chat_id.clone())
        .with_limit(args.limit)
        .with_offset(args.offset)
        .with_sort(args.sort_by.clone(), args.sort_order);

    let mut source: Box<dyn MessageSource> = if args.mock_data {
        Box::new(MockSource::new())
    } else {
        Box::new(client)
    };

    let result = match fetch_with_retry(
        source.as_mut(),
        &request,
        args.retries,
        Duration::from_secs(args.retry_delay),
    ) {
        Ok(result) => result,
        Err(err) => {
            if let Some(hint) = err.hint() {
                warn!("{hint}");
            }
            return Err(err.into());
        }
    };

    let path = FileSink::new(&args.output_dir).write(&args.chat_id, &result)?;
    print_summary(&result);
    println!("Output file: {}", path.display());
    Ok(())
}

fn run_schedule(
    config_path: PathBuf,
    interval: Option<u64>,
    test_run: bool,
    mock_data: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ConfigStore::new(&config_path).load();
    if let Some(minutes) = interval {
        info!("using custom interval: {minutes} minutes");
        config.schedule.interval_minutes = minutes;
    }

    let source: Box<dyn MessageSource> = if mock_data {
        Box::new(MockSource::new())
    } else {
        Box::new(GatewayClient::new(config.gateway_settings()))
    };
    let sink = FileSink::new(&config.output_dir);
    let mut scheduler = Scheduler::new(config, source, sink);

    if test_run {
        let report = scheduler.run_cycle();
        println!(
            "Test run: {}/{} chats fetched{}",
            report.succeeded,
            report.attempted,
            if report.skipped { " (outside enabled hours)" } else { "" }
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("scheduler stopped by user");
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    info!("scheduler started, press Ctrl+C to stop");
    scheduler.run(&shutdown);
    Ok(())
}

fn print_summary(result: &FetchResult) {
    println!("Summary:");
    println!("   - Total messages: {}", result.messages.len());
    if result.mock {
        println!("   - Source: mock data");
    }
    if let Some((oldest, newest)) = result.time_range() {
        let fmt = |secs: i64| {
            Local
                .timestamp_opt(secs, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| secs.to_string())
        };
        println!("   - Date range: {} to {}", fmt(oldest), fmt(newest));
    }
}

/// Set up logging based on verbosity level.
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_module_path(false)
        .format_target(false)
        .try_init()
        .ok();
}
