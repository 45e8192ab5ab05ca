//! Record entry and listing.

use clap::{Args, Subcommand};
use serde_json::Value as JsonValue;

use adameter_core::{AppContext, NodeKey};

use super::{open_context, runtime, OutputFormat};
use crate::config::Config;

/// Add, list and remove records
#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Add a record given as JSON (an id is generated when missing)
    Add {
        /// Collection (diaperChanges, events, feedingSessions, growthMeasurements,
        /// medicationRegimens, medications)
        collection: String,

        /// Record as a JSON object
        json: String,
    },

    /// List the records of a collection
    List {
        /// Collection name
        collection: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Remove a record by id
    Remove {
        /// Collection name
        collection: String,

        /// Record id
        id: String,
    },
}

fn parse_collection(name: &str) -> Result<NodeKey, String> {
    match NodeKey::parse(name) {
        Some(node) if node != NodeKey::FeedingInProgress => Ok(node),
        _ => Err(format!(
            "Unknown collection: {}. Valid values: {}",
            name,
            NodeKey::LISTS
                .iter()
                .map(|node| node.key())
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

impl RecordCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = runtime()?;
        rt.block_on(async {
            let mut ctx = open_context(config).await?;
            let result = self.execute(&ctx);
            if result.is_ok() {
                ctx.flush().await?;
            }
            ctx.shutdown().await;
            result
        })
    }

    fn execute(&self, ctx: &AppContext) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RecordSubcommand::Add { collection, json } => {
                let node = parse_collection(collection)?;
                let value: JsonValue = serde_json::from_str(json)?;
                let id = ctx
                    .collections()
                    .insert_json(node, value, ctx.device_id())?;
                println!("Added {} record {}", node, id);
                Ok(())
            }
            RecordSubcommand::List { collection, format } => {
                let node = parse_collection(collection)?;
                let records = ctx.collections().list_json(node)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No {} records.", node);
                            return Ok(());
                        }
                        for mut record in records {
                            let id = record
                                .as_object_mut()
                                .and_then(|fields| fields.remove("id"))
                                .and_then(|id| id.as_str().map(str::to_string))
                                .unwrap_or_default();
                            println!("{}  {}", id, record);
                        }
                    }
                }
                Ok(())
            }
            RecordSubcommand::Remove { collection, id } => {
                let node = parse_collection(collection)?;
                if ctx.collections().remove(node, id)? {
                    println!("Removed {} record {}", node, id);
                    Ok(())
                } else {
                    Err(format!("{} record not found: {}", node, id).into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collection() {
        assert_eq!(
            parse_collection("feedingSessions"),
            Ok(NodeKey::FeedingSessions)
        );
        assert_eq!(
            parse_collection("diaperchanges"),
            Ok(NodeKey::DiaperChanges)
        );
        assert!(parse_collection("feedingInProgress").is_err());
        assert!(parse_collection("meals").is_err());
    }
}
