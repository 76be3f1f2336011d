use std::io::Write as _;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the result to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout()) as Box<dyn std::io::Write + Send>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => Formatter::Table { comfy: new_table(), headers: Vec::new(), rows: 0 },
            Format::Jsonl => Formatter::Jsonl,
        };
        Ok(Output { path: self.output, io, formatter })
    }
}

/// Results are either collected into a table and written out on [`Output::commit`], or streamed
/// out as one JSON document per line as they arrive.
pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write + Send>,
    formatter: Formatter,
}

enum Formatter {
    Table { comfy: comfy_table::Table, headers: Vec<&'static str>, rows: usize },
    Jsonl,
}

fn new_table() -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy
}

impl Output {
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) {
        if let Formatter::Table { comfy, headers, .. } = &mut self.formatter {
            comfy.set_header(hdrs.clone());
            *headers = hdrs;
        }
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_rows: impl FnOnce() -> Vec<Vec<String>>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table { comfy, rows, .. } => {
                for row in table_rows() {
                    comfy.add_row(row);
                    *rows += 1;
                }
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
                self.io.flush().map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    /// Write out and reset the table accumulated so far.
    pub fn flush_table(&mut self) -> Result<(), Error> {
        let Formatter::Table { comfy, headers, rows } = &mut self.formatter else {
            return Ok(());
        };
        if *rows == 0 {
            return Ok(());
        }
        let mut fresh = new_table();
        if !headers.is_empty() {
            fresh.set_header(headers.clone());
        }
        let rendered = std::mem::replace(comfy, fresh).to_string();
        *rows = 0;
        writeln!(self.io, "{rendered}").map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.flush_table()?;
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
