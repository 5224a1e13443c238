use arrow::util::pretty::print_batches;
use clap::{Parser, Subcommand};
use hangar_client::HangarClient;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Browse and fetch datasets from a Hangar server", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the datasets the server publishes
    List,
    /// List the actions the server supports
    Actions,
    /// Print the schema of a dataset
    Schema { name: String },
    /// Fetch a dataset and print its rows
    Get { name: String },
    /// Invoke a server action, e.g. `reload` or `shutdown`
    Action { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let mut client = HangarClient::connect(args.addr.clone()).await?;

    match args.command {
        Command::List => {
            let datasets = client.list_datasets().await?;
            if datasets.is_empty() {
                println!("No datasets published by {}", args.addr);
            }
            for dataset in datasets {
                match dataset.schema {
                    Some(schema) => println!("{} ({} columns)", dataset.name, schema.fields().len()),
                    None => println!("{} (schema unavailable)", dataset.name),
                }
            }
        }
        Command::Actions => {
            for action in client.list_actions().await? {
                println!("{:<12} {}", action.r#type, action.description);
            }
        }
        Command::Schema { name } => {
            let schema = client.schema(&name).await?;
            for field in schema.fields() {
                let nullable = if field.is_nullable() { "" } else { " not null" };
                println!("{}: {}{}", field.name(), field.data_type(), nullable);
            }
        }
        Command::Get { name } => {
            let (_, batches) = client.fetch(&name).await?;
            print_batches(&batches)?;
            let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
            println!("{} rows", rows);
        }
        Command::Action { name } => {
            for body in client.do_action(&name).await? {
                println!("{}", String::from_utf8_lossy(&body));
            }
        }
    }

    Ok(())
}
