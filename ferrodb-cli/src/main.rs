use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ferrodb_core::{Database, IndexDefinition};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ferrodb")]
#[command(about = "FerroDB CLI - operator tooling for a FerroDB data directory")]
#[command(version)]
struct Cli {
    /// Database data directory
    #[arg(long, default_value = "./ferrodb-data", global = true)]
    data: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import documents from a JSON file into a collection
    Import {
        /// JSON file: either an array of documents or {"collection": [docs]}
        file: PathBuf,
        /// Target collection (required for array-shaped files)
        #[arg(long)]
        collection: Option<String>,
    },
    /// Export collections to a JSON file
    Export {
        /// Output JSON file
        file: PathBuf,
        /// Export only this collection
        #[arg(long)]
        collection: Option<String>,
    },
    /// Run a find query against a collection
    Find {
        collection: String,
        /// Query document, e.g. '{"filter": {"age": {"$gte": 18}}}'
        #[arg(default_value = "{}")]
        query: String,
    },
    /// List collections with document counts
    Collections,
    /// List the indexes of a collection
    Indexes { collection: String },
    /// Create an index from a JSON definition
    CreateIndex {
        collection: String,
        /// Definition, e.g. '{"name": "age_idx", "fields": {"age": 1}, "unique": false}'
        definition: String,
    },
    /// Show collection statistics
    Stats { collection: String },
    /// Show server info for the data directory
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = Database::open_at(&cli.data)
        .with_context(|| format!("opening database at {:?}", cli.data))?;

    match cli.command {
        Commands::Import { file, collection } => import(&db, &file, collection.as_deref()),
        Commands::Export { file, collection } => export(&db, &file, collection.as_deref()),
        Commands::Find { collection, query } => find(&db, &collection, &query),
        Commands::Collections => {
            for name in db.list_collections() {
                let count = db.count(None, &name, None).unwrap_or(0);
                println!("{}  ({} documents)", name, count);
            }
            Ok(())
        }
        Commands::Indexes { collection } => {
            let defs = db.list_indexes(&collection)?;
            if defs.is_empty() {
                println!("no indexes on '{}'", collection);
            }
            for def in defs {
                println!("{}", serde_json::to_string_pretty(&def)?);
            }
            Ok(())
        }
        Commands::CreateIndex {
            collection,
            definition,
        } => {
            let spec: Value =
                serde_json::from_str(&definition).context("parsing index definition")?;
            let def = IndexDefinition::parse(&spec)?;
            let name = def.name.clone();
            db.create_index(&collection, def)?;
            println!("created index '{}' on '{}'", name, collection);
            Ok(())
        }
        Commands::Stats { collection } => {
            let stats = db.collection_stats(&collection)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&db.info())?);
            Ok(())
        }
    }
}

fn import(db: &Database, file: &PathBuf, collection: Option<&str>) -> Result<()> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {:?}", file))?;
    let parsed: Value = serde_json::from_str(&text).context("parsing import file")?;

    let mut total = 0usize;
    match parsed {
        Value::Array(docs) => {
            let collection =
                collection.context("--collection is required for array-shaped files")?;
            total += import_into(db, collection, docs)?;
        }
        Value::Object(map) => {
            for (name, docs) in map {
                let docs = match docs {
                    Value::Array(docs) => docs,
                    _ => bail!("collection '{}' must map to an array of documents", name),
                };
                total += import_into(db, &name, docs)?;
            }
        }
        _ => bail!("import file must be a JSON array or object"),
    }

    db.flush()?;
    println!("imported {} documents", total);
    Ok(())
}

fn import_into(db: &Database, collection: &str, docs: Vec<Value>) -> Result<usize> {
    if !db.list_collections().contains(&collection.to_string()) {
        db.create_collection(collection)?;
    }
    let mut imported = 0usize;
    for doc in docs {
        match db.upsert(None, collection, doc) {
            Ok(_) => imported += 1,
            Err(e) => eprintln!("skipping document in '{}': {}", collection, e),
        }
    }
    Ok(imported)
}

fn export(db: &Database, file: &PathBuf, only: Option<&str>) -> Result<()> {
    let collections: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => db.list_collections(),
    };

    let mut output = serde_json::Map::new();
    let mut total = 0usize;
    for name in collections {
        let docs = db.find_all(None, &name, &serde_json::json!({}))?;
        total += docs.len();
        output.insert(name, Value::Array(docs));
    }

    fs::write(file, serde_json::to_string_pretty(&Value::Object(output))?)
        .with_context(|| format!("writing {:?}", file))?;
    println!("exported {} documents", total);
    Ok(())
}

fn find(db: &Database, collection: &str, query: &str) -> Result<()> {
    let query: Value = serde_json::from_str(query).context("parsing query document")?;
    let rows = db.find_all(None, collection, &query)?;
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    eprintln!("({} documents)", rows.len());
    Ok(())
}
