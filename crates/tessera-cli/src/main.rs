use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{
    Auth, DispatchConfig, Dispatcher, FindOptions, PostgresDialect, PostgresStorage, QueryAction,
    QueryCompiler, QueryValidator, Schema, StorageAdapter, StorageConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Tessera query layer CLI", long_about = None)]
struct Cli {
    /// Schema file (JSON, class name -> class definition)
    #[arg(short, long, env = "TESSERA_SCHEMA")]
    schema: PathBuf,

    /// Bypass ACLs and CLPs
    #[arg(long)]
    master: bool,

    /// Caller user id
    #[arg(long)]
    user: Option<String>,

    /// Caller roles
    #[arg(long)]
    role: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Statement {
    Find,
    Count,
    Update,
    Delete,
    Explain,
}

#[derive(clap::Args)]
struct Connection {
    #[arg(long, env = "TESSERA_DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "TESSERA_MAX_CONNECTIONS", default_value_t = 4)]
    max_connections: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SQL and parameters of a request without touching a database
    Compile {
        #[arg(long)]
        class: String,
        /// FindOptions as JSON
        #[arg(long, default_value = "{}")]
        request: String,
        #[arg(long, value_enum, default_value_t = Statement::Find)]
        statement: Statement,
        /// Update document for `--statement update`
        #[arg(long)]
        update: Option<String>,
    },
    /// Create tables, columns and indexes for the schema
    Prepare {
        /// Print the DDL instead of running it
        #[arg(long)]
        dry_run: bool,
        #[arg(long, env = "TESSERA_DATABASE_URL")]
        database_url: Option<String>,
        #[arg(long, env = "TESSERA_MAX_CONNECTIONS", default_value_t = 4)]
        max_connections: u32,
    },
    /// Run a find and print one JSON object per line
    Find {
        #[arg(long)]
        class: String,
        #[arg(long, default_value = "{}")]
        request: String,
        #[command(flatten)]
        connection: Connection,
    },
    /// Count matching objects
    Count {
        #[arg(long)]
        class: String,
        #[arg(long, default_value = "{}")]
        request: String,
        #[command(flatten)]
        connection: Connection,
    },
    /// Insert one object given as JSON
    Insert {
        #[arg(long)]
        class: String,
        #[arg(long)]
        json: String,
        #[command(flatten)]
        connection: Connection,
    },
}

fn auth(cli: &Cli) -> Auth {
    if cli.master {
        Auth::master()
    } else {
        match &cli.user {
            Some(user) => Auth::user(user.clone(), cli.role.clone()),
            None => Auth {
                roles: cli.role.clone(),
                ..Auth::anonymous()
            },
        }
    }
}

fn load_schema(path: &PathBuf) -> Result<Arc<Schema>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).context("schema is not valid JSON")?;
    Ok(Arc::new(Schema::from_json(value)?))
}

fn parse_request(raw: &str) -> Result<FindOptions> {
    serde_json::from_str(raw).context("request is not a valid FindOptions document")
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw)? {
        Value::Object(obj) => Ok(obj),
        _ => bail!("expected a JSON object"),
    }
}

async fn connect(connection: &Connection, schema: Arc<Schema>) -> Result<PostgresStorage> {
    let config = StorageConfig {
        max_connections: connection.max_connections,
        ..StorageConfig::new(connection.database_url.clone())
    };
    Ok(PostgresStorage::connect(config, schema).await?)
}

fn compile(
    schema: &Schema,
    auth: &Auth,
    class: &str,
    request: &FindOptions,
    statement: Statement,
    update: Option<&str>,
) -> Result<()> {
    let dialect = PostgresDialect;
    let validator = QueryValidator::new(schema, auth);
    let action = match statement {
        Statement::Find | Statement::Explain => QueryAction::Find,
        Statement::Count => QueryAction::Count,
        Statement::Update => QueryAction::Update,
        Statement::Delete => QueryAction::Delete,
    };
    let query = validator.decode_query(class, request, action)?;
    let mut compiler = QueryCompiler::new(schema, &dialect);
    let sql = match statement {
        Statement::Find => compiler.find(&query, None)?,
        Statement::Count => compiler.count(&query)?,
        Statement::Explain => compiler.explain(&query)?,
        Statement::Delete => compiler.delete(&query)?,
        Statement::Update => {
            let Some(raw) = update else {
                bail!("--update is required for update statements");
            };
            let update = parse_object(raw)?;
            validator.validate_attributes(class, &update, tessera_core::schema::FieldAction::Update)?;
            compiler.update(&query, &update)?
        }
    };
    let compiled = sql.compile(&dialect);
    println!("{}", compiled.text);
    for (i, param) in compiled.params.iter().enumerate() {
        println!("${} = {:?}", i + 1, param);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let schema = load_schema(&cli.schema)?;
    let auth = auth(&cli);

    match &cli.command {
        Commands::Compile {
            class,
            request,
            statement,
            update,
        } => {
            let request = parse_request(request)?;
            compile(&schema, &auth, class, &request, *statement, update.as_deref())?;
        }
        Commands::Prepare {
            dry_run,
            database_url,
            max_connections,
        } => {
            if *dry_run {
                let dialect = PostgresDialect;
                for statement in QueryCompiler::new(&schema, &dialect).prepare()? {
                    println!("{};", statement.compile(&dialect).text);
                }
            } else {
                let Some(database_url) = database_url.clone() else {
                    bail!("--database-url is required unless --dry-run is given");
                };
                let connection = Connection {
                    database_url,
                    max_connections: *max_connections,
                };
                connect(&connection, schema.clone()).await?.prepare().await?;
                tracing::info!("prepared {} classes", schema.classes().count());
            }
        }
        Commands::Find {
            class,
            request,
            connection,
        } => {
            let request = parse_request(request)?;
            let storage = connect(connection, schema.clone()).await?;
            let dispatcher = Dispatcher::new(Arc::new(storage), DispatchConfig::from_env()?);
            let mut rows = dispatcher.find_stream(&auth, class, &request).await?;
            while let Some(row) = rows.next().await {
                println!("{}", serde_json::to_string(&row?)?);
            }
        }
        Commands::Count {
            class,
            request,
            connection,
        } => {
            let request = parse_request(request)?;
            let storage = connect(connection, schema.clone()).await?;
            let dispatcher = Dispatcher::new(Arc::new(storage), DispatchConfig::from_env()?);
            println!("{}", dispatcher.count(&auth, class, &request).await?);
        }
        Commands::Insert {
            class,
            json,
            connection,
        } => {
            let object = parse_object(json)?;
            let storage = connect(connection, schema.clone()).await?;
            let dispatcher = Dispatcher::new(Arc::new(storage), DispatchConfig::from_env()?);
            for created in dispatcher.insert(&auth, class, &[object], &[]).await? {
                println!("{}", serde_json::to_string_pretty(&created)?);
            }
        }
    }
    Ok(())
}
