//! # docsync CLI
//!
//! Command-line utilities for inspecting change messages and debugging.

use anyhow::{Context, Result};
use docsync_core::{MimeKind, MimeTable, ResourcePath};
use docsync_proto::codec;
use docsync_proto::{ChangeMessage, Envelope, TopicScheme};
use serde_json::{json, Value};
use std::env;

/// Characters of decoded text shown by `inspect`.
const PREVIEW_LEN: usize = 200;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: docsync inspect <file>");
                std::process::exit(1);
            }
            let bytes = std::fs::read(&args[2])
                .with_context(|| format!("Failed to read {}", args[2]))?;
            let envelope = Envelope::from_cbor(&bytes).context("Failed to decode envelope")?;
            let message =
                ChangeMessage::from_envelope(&envelope).context("Not a change message")?;
            if let Err(err) = message.validate() {
                eprintln!("warning: {err}");
            }
            println!("{}", serde_json::to_string_pretty(&describe(&message))?);
        }
        "mime" => {
            if args.len() < 3 {
                eprintln!("Usage: docsync mime <path>");
                std::process::exit(1);
            }
            let path = ResourcePath::parse(&args[2]).context("Invalid resource path")?;
            println!("{}", resolve_mime(&MimeTable::default(), &path));
        }
        "topic" => {
            if args.len() < 3 {
                eprintln!("Usage: docsync topic <tenant>");
                std::process::exit(1);
            }
            println!("{}", TopicScheme::new(args[2].as_str()).changes());
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// JSON view of a message with its payload summarized.
fn describe(message: &ChangeMessage) -> Value {
    let payload = message.payload.as_ref().map(|body| {
        match codec::decode_body(message.content_encoding(), body) {
            Ok(content) => {
                let preview = std::str::from_utf8(&content)
                    .ok()
                    .map(|text| text.chars().take(PREVIEW_LEN).collect::<String>());
                json!({
                    "encoded_length": body.len(),
                    "decoded_length": content.len(),
                    "preview": preview,
                })
            }
            Err(err) => json!({
                "encoded_length": body.len(),
                "error": err.to_string(),
            }),
        }
    });

    json!({
        "resource_type": message.resource_type.as_str(),
        "operation": message.operation.as_str(),
        "source_path": message.source_path,
        "destination_path": message.destination_path,
        "metadata": message.metadata,
        "payload": payload,
    })
}

fn resolve_mime(mimes: &MimeTable, path: &ResourcePath) -> String {
    match mimes.for_path(path) {
        Some(mime) => {
            let kind = match mime.kind {
                MimeKind::Xml => "xml",
                MimeKind::Binary => "binary",
            };
            format!("{} ({kind})", mime.name)
        }
        None => "unknown".to_string(),
    }
}

fn print_help() {
    println!(
        r#"docsync CLI

USAGE:
    docsync <COMMAND> [OPTIONS]

COMMANDS:
    inspect <file>    Decode a CBOR change envelope and print it as JSON
    mime <path>       Show the mime type a resource path resolves to
    topic <tenant>    Print the change topic of a tenant
    help              Show this help message

EXAMPLES:
    docsync inspect ./captured.cbor
    docsync mime /db/site/report.xml
    docsync topic site-a
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_proto::keys;
    use docsync_proto::{Operation, ResourceType};

    #[test]
    fn describe_decodes_compressed_payload() {
        let content = b"<report>ok</report>";
        let message = ChangeMessage::new(ResourceType::Document, Operation::Create, "/db/r.xml")
            .with_metadata(keys::CONTENT_ENCODING, codec::ZSTD_ENCODING)
            .with_payload(codec::compress(content).unwrap());

        let view = describe(&message);
        assert_eq!(view["resource_type"], "DOCUMENT");
        assert_eq!(view["payload"]["decoded_length"], content.len());
        assert_eq!(view["payload"]["preview"], "<report>ok</report>");
    }

    #[test]
    fn describe_reports_bad_encoding() {
        let message = ChangeMessage::new(ResourceType::Document, Operation::Update, "/db/r.xml")
            .with_metadata(keys::CONTENT_ENCODING, "gzip")
            .with_payload(vec![1, 2, 3]);

        let view = describe(&message);
        assert!(view["payload"]["error"].is_string());
        assert!(view["destination_path"].is_null());
    }

    #[test]
    fn mime_resolution() {
        let mimes = MimeTable::default();
        let xml = ResourcePath::parse("/db/a/report.xml").unwrap();
        let unknown = ResourcePath::parse("/db/a/report.zzz").unwrap();
        assert_eq!(resolve_mime(&mimes, &xml), "application/xml (xml)");
        assert_eq!(resolve_mime(&mimes, &unknown), "unknown");
    }
}
