// signal-cli
// Copyright (C) 2025 Throneless Tech
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod registration;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use libsignal_protocol::IdentityKeyPair;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info};
use tracing_log::AsTrace;

use signal_common::account;
use signal_common::config::Config;
use signal_common::error::{CoreError, ExitCode, Result};
use signal_common::kbs::PinHelper;
use signal_common::SignalAccount;
use signal_store::{NullMergeSink, RecipientStore};

use registration::{RegistrationManager, RegistrationState};
use transport::{UnconfiguredKbsClient, UnconfiguredServiceClient};

/// Signal account registration and recipient inspection
#[derive(Debug, Parser, Serialize)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<PathBuf>,

    /// Directory holding the account and recipient store files
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,

    /// Verbosity
    #[command(flatten)]
    #[serde(skip)]
    verbose: Verbosity,

    #[command(subcommand)]
    #[serde(skip)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Request a verification code for a phone number
    #[command(arg_required_else_help = true)]
    Register {
        /// E.164 phone number to register, e.g. +15551234567
        number: String,

        /// Request a voice call instead of an SMS
        #[arg(long)]
        voice: bool,

        /// CAPTCHA token obtained from the signalcaptcha flow
        #[arg(long)]
        captcha: Option<String>,
    },

    /// Submit a verification code and finish registration
    #[command(arg_required_else_help = true)]
    Verify {
        /// The code delivered by SMS or voice call (dashes optional)
        code: String,

        /// Registration-lock PIN, if the account has one set
        #[arg(long)]
        pin: Option<String>,
    },

    /// Inspect the persisted recipient store
    Recipient {
        #[command(subcommand)]
        action: RecipientCommand,
    },
}

#[derive(Debug, Subcommand)]
enum RecipientCommand {
    /// List every known recipient
    List {},

    /// Show a single recipient by UUID or E.164 number
    #[command(arg_required_else_help = true)]
    Show { name: String },
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.verbose.log_level_filter().as_trace())
        .init();

    let exit_code = match run(&args).await {
        Ok(()) => ExitCode::Success,
        Err(error) => {
            error!(%error, "signal-cli failed");
            error.exit_code()
        }
    };
    std::process::exit(exit_code.into());
}

async fn run(args: &Cli) -> Result<()> {
    let config = Config::load(args.config.as_deref(), args)?;
    std::fs::create_dir_all(&config.data_dir)?;

    match &args.command {
        Commands::Register {
            number,
            voice,
            captcha,
        } => cmd_register(&config, number, *voice, captcha.as_deref()).await,
        Commands::Verify { code, pin } => cmd_verify(&config, code, pin.as_deref()).await,
        Commands::Recipient { action } => cmd_recipient(&config, action),
    }
}

fn load_or_create_account(config: &Config, number: &str) -> Result<SignalAccount> {
    let number = number
        .parse()
        .map_err(|error: signal_store::StoreError| CoreError::UserError(error.to_string()))?;

    match account::load(&config.account_path())? {
        Some(existing) => Ok(existing),
        None => {
            let mut rng = rand::rng();
            let password: String = (0..24).map(|_| rng.sample(rand::distr::Alphanumeric) as char).collect();
            let registration_id = rng.random_range(1..16_384);
            let identity_key_pair = IdentityKeyPair::generate(&mut rng);
            Ok(SignalAccount::new(
                number,
                password,
                registration_id,
                identity_key_pair,
            ))
        }
    }
}

async fn cmd_register(
    config: &Config,
    number: &str,
    voice: bool,
    captcha: Option<&str>,
) -> Result<()> {
    let account = load_or_create_account(config, number)?;
    let to_persist = account.clone();
    let service = UnconfiguredServiceClient;
    let pin_helper = PinHelper::new(UnconfiguredKbsClient, config.mrenclave.clone());
    let recipients = Arc::new(RecipientStore::open(
        config.recipient_store_path(),
        Arc::new(NullMergeSink),
    )?);
    let mut manager = RegistrationManager::new(
        account,
        service,
        pin_helper,
        config.locale.clone(),
        recipients,
    );

    manager.register(voice, captcha).await?;

    match manager.state() {
        RegistrationState::Reactivated => info!("existing registration reactivated, no code needed"),
        _ => info!("verification code requested, run `verify <code>` once it arrives"),
    }

    // register() never mutates the account's persisted fields (reactivation
    // reuses them as-is), so the pre-move clone is still what belongs on disk.
    account::save(&config.account_path(), &to_persist)?;
    Ok(())
}

async fn cmd_verify(config: &Config, code: &str, pin: Option<&str>) -> Result<()> {
    let account = account::load(&config.account_path())?.ok_or_else(|| {
        CoreError::UserError("no pending registration; run `register <number>` first".to_owned())
    })?;

    let service = UnconfiguredServiceClient;
    let pin_helper = PinHelper::new(UnconfiguredKbsClient, config.mrenclave.clone());
    let recipients = Arc::new(RecipientStore::open(
        config.recipient_store_path(),
        Arc::new(NullMergeSink),
    )?);
    let manager = RegistrationManager::resume(
        account,
        service,
        pin_helper,
        config.locale.clone(),
        recipients,
        RegistrationState::CodeRequested,
    );

    let manager = manager.verify_account(code, pin).await?;
    account::save(&config.account_path(), manager.account())?;
    info!(aci = ?manager.account().aci, "registration complete");
    Ok(())
}

fn cmd_recipient(config: &Config, action: &RecipientCommand) -> Result<()> {
    let store = RecipientStore::open(config.recipient_store_path(), Arc::new(NullMergeSink))?;
    match action {
        RecipientCommand::List {} => {
            let mut recipients = store.list();
            recipients.sort_by_key(|(id, _)| *id);
            for (id, recipient) in recipients {
                println!("{id}\t{}", recipient.address);
            }
        }
        RecipientCommand::Show { name } => {
            let addr = registration_lookup_address(name)?;
            let id = addr
                .uuid()
                .and_then(|uuid| store.by_uuid(uuid))
                .or_else(|| addr.number().and_then(|number| store.by_number(number)))
                .ok_or_else(|| CoreError::UserError(format!("no recipient known for {name}")))?;
            let recipient = store
                .get(id)?
                .ok_or_else(|| CoreError::Unexpected(format!("recipient {id} vanished")))?;
            println!("{id}\t{}", recipient.address);
            if let Some(contact) = &recipient.contact {
                println!("  name: {}", contact.name);
            }
            if let Some(profile) = &recipient.profile {
                if let Some(given_name) = &profile.given_name {
                    println!("  profile name: {given_name}");
                }
            }
        }
    }
    Ok(())
}

fn registration_lookup_address(name: &str) -> Result<signal_store::RecipientAddress> {
    if let Ok(uuid) = uuid::Uuid::parse_str(name) {
        return Ok(signal_store::RecipientAddress::from_uuid(uuid));
    }
    let number: signal_store::E164 = name
        .parse()
        .map_err(|error: signal_store::StoreError| CoreError::UserError(error.to_string()))?;
    Ok(signal_store::RecipientAddress::from_number(number))
}
