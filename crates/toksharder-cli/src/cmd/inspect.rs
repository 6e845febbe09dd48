//! `toksharder inspect` - list shards and check output invariants

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, CellAlignment, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use toksharder_core::{fmt_num, list_shards, read_shard};

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Output directory to check
    #[arg(default_value = "shards")]
    pub dir: PathBuf,

    /// Expected tokens per shard; enables the full-size check
    #[arg(short, long)]
    pub shard_size: Option<usize>,
}

/// Invariant violations for shards given as `(index, tokens)` in index order.
fn check_shards(shards: &[(usize, usize)], shard_size: Option<usize>) -> Vec<String> {
    let mut problems = Vec::new();

    for (position, &(index, _)) in shards.iter().enumerate() {
        if index != position {
            problems.push(format!("expected shard {position:05}, found {index:05}"));
            break;
        }
    }

    if let Some((&(last_index, last_len), full)) = shards.split_last() {
        if let Some(size) = shard_size {
            for &(index, len) in full {
                if len != size {
                    problems.push(format!("shard {index:05} has {len} tokens, expected {size}"));
                }
            }
            if last_len > size {
                problems.push(format!(
                    "last shard {last_index:05} has {last_len} tokens, more than {size}"
                ));
            }
        }
        if last_len == 0 {
            problems.push(format!("last shard {last_index:05} is empty"));
        }
    }
    problems
}

pub fn run(args: InspectArgs) -> Result<()> {
    let shards = list_shards(&args.dir)
        .with_context(|| format!("failed to read {}", args.dir.display()))?;
    if shards.is_empty() {
        anyhow::bail!("no shard files in {}", args.dir.display());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("File").fg(Color::Cyan),
            Cell::new("Tokens").fg(Color::Cyan),
        ]);

    let mut sizes = Vec::with_capacity(shards.len());
    let mut total = 0usize;
    for (index, path) in &shards {
        let tokens = read_shard(path).with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(name),
            Cell::new(fmt_num(tokens.len())).set_alignment(CellAlignment::Right),
        ]);
        total += tokens.len();
        sizes.push((*index, tokens.len()));
    }
    table.add_row(vec![
        Cell::new("total"),
        Cell::new(fmt_num(total)).set_alignment(CellAlignment::Right),
    ]);
    eprintln!("\n{table}");

    let problems = check_shards(&sizes, args.shard_size);
    if problems.is_empty() {
        log::info!("{} shards, {} tokens: OK", shards.len(), fmt_num(total));
        return Ok(());
    }
    for problem in &problems {
        log::error!("{problem}");
    }
    anyhow::bail!("{} problems found in {}", problems.len(), args.dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_output() {
        let shards = [(0, 10), (1, 10), (2, 3)];
        assert!(check_shards(&shards, Some(10)).is_empty());
        assert!(check_shards(&shards, None).is_empty());
    }

    #[test]
    fn gap_in_indices() {
        let problems = check_shards(&[(0, 10), (2, 10)], None);
        assert_eq!(problems, vec!["expected shard 00001, found 00002".to_string()]);
    }

    #[test]
    fn short_shard_before_last() {
        let problems = check_shards(&[(0, 10), (1, 7), (2, 10)], Some(10));
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("shard 00001 has 7 tokens"));
    }

    #[test]
    fn oversized_or_empty_last_shard() {
        assert_eq!(check_shards(&[(0, 12)], Some(10)).len(), 1);
        assert_eq!(check_shards(&[(0, 10), (1, 0)], Some(10)).len(), 1);
    }

    #[test]
    fn inspects_written_shards() {
        use toksharder_core::{ShardFormat, ShardSink, ShardWriter};

        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::new(dir.path(), ShardFormat::Npy);
        writer.write_shard(0, &[1, 2, 3]).unwrap();
        writer.write_shard(1, &[4]).unwrap();

        let ok = run(InspectArgs {
            dir: dir.path().to_path_buf(),
            shard_size: Some(3),
        });
        assert!(ok.is_ok());

        let bad = run(InspectArgs {
            dir: dir.path().to_path_buf(),
            shard_size: Some(2),
        });
        assert!(bad.is_err());
    }
}
