use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use csv::ReaderBuilder;
use prettytable::{Cell, Row, Table};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbf::{
    AccessMode, DbfConfig, DbfError, FieldDescriptor, KeyTransform, RecPos, TableHandle, Value,
    Workspace,
};

/// Flat-file tables with B-tree indexes
#[derive(Parser, Debug)]
#[command(name = "dbf", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty table from NAME:TYPE:LENGTH[:DECIMALS] field definitions
    Create {
        table: PathBuf,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Show the header and field layout of a table
    Info { table: PathBuf },
    /// Append rows from a CSV file whose columns follow the table's fields
    Import {
        table: PathBuf,
        csv: PathBuf,
        /// The first CSV row is data, not a header
        #[arg(long)]
        no_header: bool,
    },
    /// Append one record, one value per field
    Append {
        table: PathBuf,
        values: Vec<String>,
        /// Index files to keep up to date
        #[arg(long = "index")]
        indexes: Vec<PathBuf>,
    },
    /// Print records, in record order or in the order of an index
    List {
        table: PathBuf,
        #[arg(long)]
        index: Option<PathBuf>,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
        /// Include records marked deleted
        #[arg(long)]
        deleted: bool,
    },
    /// Build an index file over a field
    Index {
        table: PathBuf,
        index: PathBuf,
        field: String,
        #[arg(long, value_enum, default_value_t = TransformArg::Verbatim)]
        transform: TransformArg,
    },
    /// Find the first record whose key starts with KEY
    Seek {
        table: PathBuf,
        index: PathBuf,
        key: String,
    },
    /// Mark a record deleted (or undeleted)
    Delete {
        table: PathBuf,
        record: RecPos,
        #[arg(long)]
        undo: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransformArg {
    Verbatim,
    Upper,
    Numeric,
}

impl From<TransformArg> for KeyTransform {
    fn from(arg: TransformArg) -> Self {
        match arg {
            TransformArg::Verbatim => KeyTransform::Verbatim,
            TransformArg::Upper => KeyTransform::UpperCase,
            TransformArg::Numeric => KeyTransform::Numeric,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Dbf(#[from] DbfError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Usage(String),
}

type CliResult<T> = Result<T, CliError>;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbf=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let config = match &cli.config {
        Some(path) => DbfConfig::from_json_file(path)?,
        None => DbfConfig::default(),
    };
    let mut ws = Workspace::on_disk(config)?;

    match cli.command {
        Command::Create { table, fields } => create(&mut ws, &table, &fields),
        Command::Info { table } => show_info(&mut ws, &table),
        Command::Import {
            table,
            csv,
            no_header,
        } => import(&mut ws, &table, &csv, !no_header),
        Command::Append {
            table,
            values,
            indexes,
        } => append(&mut ws, &table, &values, &indexes),
        Command::List {
            table,
            index,
            limit,
            deleted,
        } => list(&mut ws, &table, index.as_deref(), limit, deleted),
        Command::Index {
            table,
            index,
            field,
            transform,
        } => build_index(&mut ws, &table, &index, &field, transform.into()),
        Command::Seek { table, index, key } => seek(&mut ws, &table, &index, &key),
        Command::Delete {
            table,
            record,
            undo,
        } => {
            let handle = ws.open_table(&table, AccessMode::ReadWrite)?;
            ws.table_mut(handle)?.set_deleted(record, !undo)?;
            ws.close_table(handle)?;
            Ok(())
        }
    }?;

    ws.close_all()?;
    Ok(())
}

fn create(ws: &mut Workspace, table: &Path, definitions: &[String]) -> CliResult<()> {
    let fields = definitions
        .iter()
        .map(|definition| FieldDescriptor::parse_definition(definition))
        .collect::<Result<Vec<_>, _>>()?;
    let handle = ws.create_table(table, fields)?;
    ws.close_table(handle)?;
    println!("Created {}", table.display());
    Ok(())
}

fn show_info(ws: &mut Workspace, table: &Path) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadOnly)?;
    let work_area = ws.table(handle)?;
    let header = work_area.header();

    println!("Table:         {}", table.display());
    println!("Records:       {}", header.record_count);
    println!("Record length: {}", header.record_length);
    println!("Header length: {}", header.header_length);
    println!("Count width:   {:?}", header.width);
    if let Some(date) = header.last_update() {
        println!("Last update:   {}", date);
    }

    let mut layout = Table::new();
    layout.set_titles(Row::new(
        ["Field", "Type", "Offset", "Length", "Decimals"]
            .iter()
            .map(|title| Cell::new(title))
            .collect(),
    ));
    for field in work_area.fields() {
        layout.add_row(Row::new(vec![
            Cell::new(&field.name),
            Cell::new(&(field.field_type.tag() as char).to_string()),
            Cell::new(&field.offset.to_string()),
            Cell::new(&field.length.to_string()),
            Cell::new(&field.decimals.to_string()),
        ]));
    }
    layout.printstd();

    ws.close_table(handle)?;
    Ok(())
}

/// Parse one input row into values for every field
fn parse_row<'a>(
    ws: &Workspace,
    handle: TableHandle,
    inputs: impl ExactSizeIterator<Item = &'a str>,
) -> CliResult<Vec<Value>> {
    let fields = ws.table(handle)?.fields();
    if inputs.len() != fields.len() {
        return Err(CliError::Usage(format!(
            "expected {} values, got {}",
            fields.len(),
            inputs.len()
        )));
    }
    Ok(inputs
        .zip(fields)
        .map(|(input, field)| Value::parse(input, field))
        .collect::<Result<Vec<_>, _>>()?)
}

fn import(ws: &mut Workspace, table: &Path, csv_path: &Path, has_headers: bool) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadWrite)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(false)
        .from_path(csv_path)?;

    // One lock for the whole import instead of one per record
    ws.lock(handle)?;
    let mut imported = 0usize;
    for row in reader.records() {
        let row = row?;
        let values = parse_row(ws, handle, row.iter().collect::<Vec<_>>().into_iter())?;
        ws.append_values(handle, &values)?;
        imported += 1;
    }
    ws.unlock(handle)?;

    info!(records = imported, "import finished");
    println!("Imported {} records into {}", imported, table.display());
    ws.close_table(handle)?;
    Ok(())
}

fn append(
    ws: &mut Workspace,
    table: &Path,
    inputs: &[String],
    indexes: &[PathBuf],
) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadWrite)?;
    for index in indexes {
        ws.open_index(handle, index)?;
    }

    let values = parse_row(ws, handle, inputs.iter().map(String::as_str))?;
    let record = ws.append_values(handle, &values)?;
    println!("Appended record {}", record);

    ws.close_table(handle)?;
    Ok(())
}

fn list(
    ws: &mut Workspace,
    table: &Path,
    index: Option<&Path>,
    limit: Option<usize>,
    include_deleted: bool,
) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadOnly)?;
    let order: Vec<RecPos> = match index {
        Some(index) => {
            ws.open_index(handle, index)?;
            let mut records = Vec::new();
            while let Some(record) = ws.next(handle)? {
                records.push(record);
            }
            records
        }
        None => (0..ws.table(handle)?.record_count()).collect(),
    };

    let work_area = ws.table_mut(handle)?;
    let mut output = Table::new();
    let mut titles = vec![Cell::new("#")];
    titles.extend(work_area.fields().iter().map(|field| Cell::new(&field.name)));
    output.set_titles(Row::new(titles));

    let mut shown = 0;
    for record in order {
        if limit.is_some_and(|limit| shown >= limit) {
            break;
        }
        if !include_deleted && work_area.is_deleted(record)? {
            continue;
        }
        let values = work_area.read_values(record)?;
        let mut cells = vec![Cell::new(&record.to_string())];
        cells.extend(values.iter().map(|value| Cell::new(&value.to_string())));
        output.add_row(Row::new(cells));
        shown += 1;
    }
    output.printstd();

    ws.close_table(handle)?;
    Ok(())
}

fn build_index(
    ws: &mut Workspace,
    table: &Path,
    index: &Path,
    field: &str,
    transform: KeyTransform,
) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadWrite)?;
    let slot = ws.build_index(handle, index, field, transform)?;

    let work_area = ws.table(handle)?;
    let pack = &work_area.indexes()[slot];
    println!(
        "Indexed {} records of {} on {} ({} keys per page)",
        work_area.record_count(),
        table.display(),
        field.to_ascii_uppercase(),
        pack.capacity()
    );

    ws.close_table(handle)?;
    Ok(())
}

fn seek(ws: &mut Workspace, table: &Path, index: &Path, key: &str) -> CliResult<()> {
    let handle = ws.open_table(table, AccessMode::ReadOnly)?;
    ws.open_index(handle, index)?;

    match ws.seek(handle, key) {
        Ok(record) => {
            let values = ws.table_mut(handle)?.read_values(record)?;
            let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
            println!("{}: {}", record, rendered.join(" | "));
        }
        Err(DbfError::KeyNotFound(_)) => println!("No record matches {:?}", key),
        Err(err) => return Err(err.into()),
    }

    ws.close_table(handle)?;
    Ok(())
}
