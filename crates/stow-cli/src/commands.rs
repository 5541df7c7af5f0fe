use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use colored::Colorize;
use serde_json::json;
use stow_packer::{Item, Packer, PackerConfig};
use stow_view::{Context, FileView};
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let ctx = Context::background();
    let format = cli.format;
    match cli.command {
        Command::Put(args) => cmd_put(&open_packer(&ctx, &cli.root, config)?, &ctx, args, format),
        Command::Get(args) => cmd_get(&open_packer(&ctx, &cli.root, config)?, &ctx, args, format),
        Command::Delete(args) => cmd_delete(&open_packer(&ctx, &cli.root, config)?, &ctx, args),
        Command::List(args) => cmd_list(&open_packer(&ctx, &cli.root, config)?, &ctx, args, format),
        Command::Locate(args) => cmd_locate(&open_packer(&ctx, &cli.root, config)?, &ctx, args, format),
        Command::Stats => cmd_stats(&open_packer(&ctx, &cli.root, config)?, &ctx, format),
        Command::Config(args) => cmd_config(&ctx, &cli.root, config, args),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PackerConfig> {
    let Some(path) = path else {
        return Ok(PackerConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(PackerConfig::from_toml_str(&text)?)
}

fn open_packer(ctx: &Context, root: &Path, config: PackerConfig) -> anyhow::Result<Packer> {
    let view = FileView::open(root).with_context(|| format!("opening {}", root.display()))?;
    debug!(root = %root.display(), "opening packer");
    Ok(Packer::open(ctx, Arc::new(view), config)?)
}

fn cmd_put(packer: &Packer, ctx: &Context, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let payload = match (args.value, args.file) {
        (Some(value), _) => value.into_bytes(),
        (None, Some(path)) => {
            fs::read(&path).with_context(|| format!("reading {}", path.display()))?
        }
        (None, None) => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    let size = payload.len();
    let key = packer.put_item(ctx, &Item::new(args.id.clone(), payload))?;
    match format {
        OutputFormat::Json => println!("{}", json!({ "id": args.id, "bucket": key, "size": size })),
        OutputFormat::Text => println!(
            "{} Stored {} ({} bytes) in bucket {}",
            "✓".green().bold(),
            args.id.bold(),
            size,
            key.cyan()
        ),
    }
    Ok(())
}

fn cmd_get(packer: &Packer, ctx: &Context, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let Some(item) = packer.get_item(ctx, &args.id)? else {
        bail!("item {} not found", args.id);
    };
    if let Some(path) = &args.output {
        fs::write(path, &item.payload).with_context(|| format!("writing {}", path.display()))?;
        println!("{} Wrote {} bytes to {}", "✓".green().bold(), item.payload.len(), path.display());
        return Ok(());
    }
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "id": item.id,
                "size": item.payload.len(),
                "payload": String::from_utf8_lossy(&item.payload),
            })
        ),
        OutputFormat::Text => {
            let mut out = io::stdout().lock();
            out.write_all(&item.payload)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn cmd_delete(packer: &Packer, ctx: &Context, args: DeleteArgs) -> anyhow::Result<()> {
    let ids: Vec<&str> = args.ids.iter().map(String::as_str).collect();
    packer.delete_items(ctx, &ids)?;
    println!("{} Deleted {} item(s)", "✓".green().bold(), ids.len());
    Ok(())
}

fn cmd_list(packer: &Packer, ctx: &Context, args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for item in packer.iterate(ctx, &args.prefix) {
        let item = item?;
        let location = if args.long {
            Some(packer.locate(ctx, &item.id)?)
        } else {
            None
        };
        rows.push((item.id, item.payload.len(), location));
    }
    rows.sort();

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = rows
                .iter()
                .map(|(id, size, location)| json!({ "id": id, "size": size, "location": location }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("No items.");
            }
            for (id, size, location) in &rows {
                match location {
                    Some(location) => println!("{}  {:>8}  {}", id.bold(), size, location.cyan()),
                    None => println!("{}  {:>8}", id.bold(), size),
                }
            }
        }
    }
    Ok(())
}

fn cmd_locate(packer: &Packer, ctx: &Context, args: LocateArgs, format: OutputFormat) -> anyhow::Result<()> {
    let location = packer.locate(ctx, &args.id)?;
    let owner = packer.bucket_for(ctx, &args.id)?;
    let stored = owner
        .as_ref()
        .is_some_and(|b| b.get(&packer.addresser().hash(&args.id), &args.id).is_some());
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "id": args.id,
                "location": location,
                "bucket": owner.as_ref().map(|b| &b.key),
                "depth": owner.as_ref().map(|b| b.depth),
                "stored": stored,
            })
        ),
        OutputFormat::Text => {
            println!("{} -> {}", args.id.bold(), location.cyan());
            if let Some(bucket) = &owner {
                println!("  Bucket: {} (depth {}, {} bytes)", bucket.key.yellow(), bucket.depth, bucket.size);
            }
            let status = if stored { "stored".green() } else { "absent".dimmed() };
            println!("  Item: {status}");
        }
    }
    Ok(())
}

fn cmd_stats(packer: &Packer, ctx: &Context, format: OutputFormat) -> anyhow::Result<()> {
    let stats = packer.stats(ctx)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("Buckets:        {} ({} primary)", stats.buckets.to_string().bold(), stats.primaries);
            println!("Items:          {}", stats.items.to_string().bold());
            println!("Max depth:      {}", stats.max_depth);
            println!("Stored bytes:   {}", stats.stored_bytes);
            println!(
                "Largest bucket: {} / {} bytes",
                stats.largest_bucket,
                packer.config().max_bucket_size()
            );
        }
    }
    Ok(())
}

fn cmd_config(ctx: &Context, root: &Path, config: PackerConfig, args: ConfigArgs) -> anyhow::Result<()> {
    let effective = if args.defaults {
        PackerConfig::default()
    } else {
        open_packer(ctx, root, config)?.config().clone()
    };
    print!("{}", effective.to_toml_string()?);
    Ok(())
}
