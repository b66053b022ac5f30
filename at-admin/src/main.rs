// Device Administration Backend

use anyhow::{Context, Result};
use at_admin::{
    bridge::{self, BridgeConfig},
    config::{self, DEFAULT_CONFIG_PATH},
    error,
    exec::{BackgroundJob, DetachedWorker, SystemRunner},
    firewall::{self, Chain, FirewallConfig, RuleMode},
    firmware::{self, JobStatus, RebootNotice},
    flags::{FlagState, TransactionFlag},
    form::Form,
    network::{self, SaveOutcome},
    store::Store,
    transaction,
    types::{Config, FlashRegion},
};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Exit status for input the form has to correct
const EXIT_VALIDATION: u8 = 2;

/// Exit status for any other failure
const EXIT_FAILURE: u8 = 1;

#[derive(Parser)]
#[command(name = "at-admin")]
#[command(about = "Device administration backend", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Submitted form values
#[derive(ClapArgs)]
struct FormArgs {
    /// Form field, repeatable
    #[arg(short = 'f', long = "field", value_name = "NAME=VALUE")]
    fields: Vec<String>,
}

impl FormArgs {
    fn form(&self) -> Result<Form> {
        Form::from_fields(&self.fields)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show the primary interface configuration
    NetworkShow,
    /// Save the network settings form
    NetworkSave(FormArgs),
    /// Show the firewall configuration, staged edits included
    FirewallShow,
    /// Show the firewall script the current configuration would install
    FirewallScript,
    /// Apply the policy form and commit the firewall
    FirewallUpdate(FormArgs),
    /// Keep the policy form while editing rules
    FirewallStage(FormArgs),
    /// Add a rule from the rule form
    FirewallAddRule(FormArgs),
    /// Replace a rule from the rule form
    FirewallEditRule(FormArgs),
    /// Delete the ticked rules of one chain
    FirewallDeleteRules {
        #[arg(long, value_enum)]
        chain: ChainArg,
        #[command(flatten)]
        form: FormArgs,
    },
    /// Discard staged firewall edits
    FirewallCancel,
    /// Show the bridge configuration
    BridgeShow,
    /// Save the bridge form, commit and reboot
    BridgeSave(FormArgs),
    /// List firmware images on offer
    FirmwareOptions,
    /// Set the firmware download location
    FirmwareUrl(FormArgs),
    /// Start writing a firmware image
    FirmwareUpdate {
        #[arg(long, value_enum)]
        region: RegionArg,
        #[command(flatten)]
        form: FormArgs,
    },
    /// Report on a running firmware update
    FirmwareStatus,
    /// Reboot the device
    Reboot,
    /// Save the live configuration to flash
    Commit,
    /// Restore the configuration held in flash
    Rollback,
    /// Reset flash to factory defaults
    FactoryReset,
    /// Show the transaction flags
    Status,
    /// Mark a flag as seen
    Acknowledge {
        #[arg(value_enum)]
        flag: FlagArg,
    },
    /// Execute a serialized background job
    #[command(name = "run-job", hide = true)]
    RunJob { job: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ChainArg {
    Input,
    Output,
    Forward,
}

impl From<ChainArg> for Chain {
    fn from(arg: ChainArg) -> Self {
        match arg {
            ChainArg::Input => Chain::Input,
            ChainArg::Output => Chain::Output,
            ChainArg::Forward => Chain::Forward,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RegionArg {
    Userland,
    Kernel,
}

impl From<RegionArg> for FlashRegion {
    fn from(arg: RegionArg) -> Self {
        match arg {
            RegionArg::Userland => FlashRegion::Userland,
            RegionArg::Kernel => FlashRegion::Kernel,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FlagArg {
    UnsavedSettings,
    UpdatedFirmware,
    SettingsInitialized,
}

impl From<FlagArg> for TransactionFlag {
    fn from(arg: FlagArg) -> Self {
        match arg {
            FlagArg::UnsavedSettings => TransactionFlag::UnsavedSettings,
            FlagArg::UpdatedFirmware => TransactionFlag::UpdatedFirmware,
            FlagArg::SettingsInitialized => TransactionFlag::SettingsInitialized,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match config::load_config_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // One short-lived action per process; 2 threads cover the command
    // spawns and timers
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("at-admin")
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build runtime: {}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match runtime.block_on(run(args, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(invalid) = error::as_validation(&e) {
                println!("{}", invalid.message);
                return ExitCode::from(EXIT_VALIDATION);
            }
            log::error!("{:#}", e);
            println!("An error occurred");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let store = Store::new(
        config.paths,
        Arc::new(SystemRunner),
        Arc::new(DetachedWorker::new(Some(args.config.clone()))),
    );

    match args.command {
        Command::NetworkShow => {
            let settings = store.settings()?;
            let current = network::get_current(store.paths(), &settings.primary_if)
                .context("Failed to get network info")?;
            println!("interface: {}", settings.primary_if);
            println!("mode: {:?}", current.mode);
            if !current.is_dhcp() {
                println!("address: {}", current.address);
                println!("netmask: {}", current.netmask);
                println!("broadcast: {}", current.broadcast);
                println!("gateway: {}", current.gateway);
                println!("nameserver: {}", current.nameserver);
            }
        }
        Command::NetworkSave(form) => match network::save_settings(&store, &form.form()?).await? {
            SaveOutcome::Unchanged => println!("No changes made"),
            SaveOutcome::Applied {
                interface_changed, ..
            } => {
                if interface_changed {
                    println!("Network settings updated, the interface is restarting");
                } else {
                    println!("Network settings updated");
                }
            }
        },
        Command::FirewallShow => {
            let config = FirewallConfig::load_auto(&store)?;
            print_firewall(&config);
        }
        Command::FirewallScript => print!("{}", firewall::script(&store)?),
        Command::FirewallUpdate(form) => {
            firewall::update(&store, &form.form()?).await?;
            println!("Firewall updated");
        }
        Command::FirewallStage(form) => {
            firewall::stage_policy(&store, &form.form()?)?;
        }
        Command::FirewallAddRule(form) => {
            firewall::save_rule(&store, &form.form()?, RuleMode::Add)?;
        }
        Command::FirewallEditRule(form) => {
            firewall::save_rule(&store, &form.form()?, RuleMode::Replace)?;
        }
        Command::FirewallDeleteRules { chain, form } => {
            let deleted = firewall::delete_selected(&store, &form.form()?, chain.into())?;
            println!("Deleted {} rule(s)", deleted);
        }
        Command::FirewallCancel => firewall::cancel(&store).await?,
        Command::BridgeShow => match BridgeConfig::load(&store.paths().bridges)? {
            Some(bridge) => print!("{}", bridge.render()),
            None => println!("No bridge configuration"),
        },
        Command::BridgeSave(form) => {
            let notice = bridge::save_settings(&store, &form.form()?).await?;
            print_reboot(&notice);
        }
        Command::FirmwareOptions => {
            let options = firmware::update_options(&store).await?;
            if options.is_empty() {
                println!("No update options could be found");
            }
            for (name, url) in &options.userland {
                println!("userland {} {}", name, url);
            }
            for (name, url) in &options.kernel {
                println!("kernel {} {}", name, url);
            }
        }
        Command::FirmwareUrl(form) => {
            firmware::change_url(&store, &form.form()?).await?;
            println!("Firmware URL updated");
        }
        Command::FirmwareUpdate { region, form } => {
            firmware::update(&store, &form.form()?, region.into())?;
            println!("Updating firmware");
        }
        Command::FirmwareStatus => match firmware::poll_status(&store).await? {
            JobStatus::Flashing => println!("Updating firmware"),
            JobStatus::Completed(outcome) => println!("{}", outcome.message()),
        },
        Command::Reboot => {
            let notice = firmware::reboot(&store).await?;
            print_reboot(&notice);
        }
        Command::Commit => {
            transaction::commit(&store).await?;
            println!("Settings Saved");
        }
        Command::Rollback => {
            transaction::rollback(&store).await?;
            println!("Settings loaded");
        }
        Command::FactoryReset => {
            transaction::factory_reset(&store).await?;
            println!("Settings restored");
        }
        Command::Status => {
            let flags = store.flags();
            for flag in [
                TransactionFlag::UnsavedSettings,
                TransactionFlag::UpdatedFirmware,
                TransactionFlag::SettingsInitialized,
            ] {
                let state = match flags.state(flag) {
                    Some(FlagState::NotYetChecked) => "set",
                    Some(FlagState::Checked) => "acknowledged",
                    None => "clear",
                };
                println!("{}: {}", flag.file_name(), state);
            }
        }
        Command::Acknowledge { flag } => transaction::acknowledge(&store, flag.into())?,
        Command::RunJob { job } => {
            let job = BackgroundJob::decode(&job)?;
            store.run_job(job).await?;
        }
    }

    Ok(())
}

fn print_firewall(config: &FirewallConfig) {
    if let Some(forward) = config.option(firewall::OPTION_IP_FORWARD) {
        println!("IP_FORWARD: {}", forward);
    }
    for chain in Chain::ALL {
        println!(
            "{} policy {}",
            chain.name(),
            config.policy(chain).unwrap_or("ACCEPT")
        );
        for (index, rule) in config.user_rules(chain).iter().enumerate() {
            println!("  {} {}", index, rule.to_args());
        }
    }
}

fn print_reboot(notice: &RebootNotice) {
    let address = if notice.network.is_dhcp() {
        "auto".to_string()
    } else {
        format!("static ({})", notice.network.address)
    };
    println!("Rebooting, please wait {} seconds", notice.secs);
    println!("IP address: {}", address);
}
