use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use paychan::application::PaymentClient;
use paychan::config::ClientConfig;
use paychan::domain::account::{ADDRESS_LEN, Account, Address};
use paychan::domain::currency::CurrencyConverter;
use paychan::domain::ports::Observer;
use paychan::infrastructure::in_memory::InMemoryNetwork;
use paychan::infrastructure::wallet::WalletBalanceSource;
use paychan::interfaces::console::ConsoleObserver;
use paychan::interfaces::render::render_balance;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Client configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query the wallet server once and print the available balance
    Balance {
        #[arg(long)]
        wallet_id: String,

        /// Overrides the wallet url from the configuration
        #[arg(long)]
        wallet_url: Option<String>,
    },
    /// Poll a wallet balance and print every change until Ctrl-C
    Watch {
        #[arg(long)]
        wallet_id: String,

        /// Hex-encoded address of the account
        #[arg(long)]
        address: Address,
    },
    /// Run two in-process parties through a full channel lifecycle
    Demo {
        /// Deposit of each party, in ADA
        #[arg(long, default_value = "5")]
        deposit: Decimal,

        /// Initial on-chain funds of each party, in ADA
        #[arg(long, default_value = "100")]
        funds: Decimal,
    },
}

fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match log_file {
        Some(path) => {
            let file = File::create(path).into_diagnostic()?;
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path).into_diagnostic()?,
        None => ClientConfig::default(),
    };

    match cli.command {
        Command::Balance {
            wallet_id,
            wallet_url,
        } => {
            let url = wallet_url.unwrap_or_else(|| config.wallet_url.clone());
            let source = WalletBalanceSource::new(url, config.balance_timeout()).into_diagnostic()?;
            let amount = source.query_wallet(&wallet_id).await.into_diagnostic()?;
            println!("{}", render_balance(amount, &CurrencyConverter::ADA));
        }
        Command::Watch { wallet_id, address } => watch(config, wallet_id, address).await?,
        Command::Demo { deposit, funds } => demo(config, deposit, funds).await?,
    }

    Ok(())
}

async fn watch(config: ClientConfig, wallet_id: String, address: Address) -> Result<()> {
    let source = WalletBalanceSource::new(config.wallet_url.clone(), config.balance_timeout())
        .into_diagnostic()?;
    let account = Account::new(address, wallet_id).into_diagnostic()?;
    let network = InMemoryNetwork::new();
    let client = PaymentClient::new(
        "watch",
        account,
        config,
        network.engine(address),
        Arc::new(source),
    )
    .into_diagnostic()?;

    let observer: Arc<dyn Observer> = Arc::new(ConsoleObserver::stdout(client.display_address()));
    client.register(&observer);

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    client.shutdown().await.into_diagnostic()?;
    Ok(())
}

async fn demo(config: ClientConfig, deposit: Decimal, funds: Decimal) -> Result<()> {
    let converter = CurrencyConverter::ADA;
    let network = InMemoryNetwork::new();
    let funds = converter.to_smallest_unit(funds).into_diagnostic()?;

    let mut parties = Vec::new();
    for (name, byte) in [("Alice", 0xa1), ("Bob", 0xb0)] {
        let address = Address::new([byte; ADDRESS_LEN]);
        network.fund(address, funds);
        let account = Account::new(address, name.to_lowercase()).into_diagnostic()?;
        let client = PaymentClient::new(
            name,
            account,
            config.clone(),
            network.engine(address),
            Arc::new(network.clone()),
        )
        .into_diagnostic()?;
        network.wait_for_endpoint(address).await;

        let observer: Arc<dyn Observer> = Arc::new(ConsoleObserver::stdout(name));
        client.register(&observer);
        parties.push((client, observer));
    }
    let (alice, bob) = (&parties[0].0, &parties[1].0);

    let channel = alice.open_channel(bob.address(), deposit).await.into_diagnostic()?;
    bob.accepted_channel().await.into_diagnostic()?;
    info!(channel = %channel.id(), "Demo channel open");

    alice.send_payment_to_peer(dec!(3)).await.into_diagnostic()?;
    bob.send_payment_to_peer(dec!(1)).await.into_diagnostic()?;
    alice.send_payment_to_peer(dec!(1)).await.into_diagnostic()?;

    alice.settle().await.into_diagnostic()?;
    bob.settle().await.into_diagnostic()?;

    for (client, _) in &parties {
        client.refresh_balance().await.into_diagnostic()?;
        println!(
            "{} on-chain balance: {} {}",
            client.name(),
            render_balance(network.ledger_balance(&client.address()), &converter),
            converter.symbol()
        );
    }
    for (client, _) in &parties {
        client.shutdown().await.into_diagnostic()?;
    }
    Ok(())
}
