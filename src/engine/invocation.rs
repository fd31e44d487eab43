//! Structured invocation descriptors for the scan engine.
//!
//! Commands are never assembled as shell text. Each argument template is
//! rendered on its own and handed to the OS as a separate argv entry.

use crate::model::RunConfig;
use crate::partition::Partition;
use crate::storage::RunLayout;
use std::path::{Path, PathBuf};

/// Keyword the engine substitutes per line of the partition file.
pub const ITEM_KEYWORD: &str = "ITEM";
pub const DEFAULT_TARGET_PATTERN: &str = "https://{item}/.git/config";
pub const DEFAULT_WORDLIST_PATTERN: &str = "https://{item}/FUZZ";

const PARTITION_ARGS: &[&str] = &[
    "-w", "{input}:ITEM", "-u", "{target}", "-t", "{threads}", "-o", "{output}", "-of", "json",
    "-s",
];
const ITEM_ARGS: &[&str] = &[
    "-w", "{wordlist}", "-u", "{target}", "-t", "{threads}", "-o", "{output}", "-of", "json",
    "-s",
];

/// A fully rendered engine run: executable, argv, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Where the engine is told to write its artifact.
    pub output: PathBuf,
}

pub fn default_args(per_item: bool) -> Vec<String> {
    let src = if per_item { ITEM_ARGS } else { PARTITION_ARGS };
    src.iter().map(|s| s.to_string()).collect()
}

pub fn default_target_pattern(per_item: bool) -> &'static str {
    if per_item {
        DEFAULT_WORDLIST_PATTERN
    } else {
        DEFAULT_TARGET_PATTERN
    }
}

struct Values<'a> {
    input: &'a Path,
    output: &'a Path,
    target: &'a str,
    item: &'a str,
    threads: u32,
    wordlist: Option<&'a Path>,
}

/// Invocation covering a whole partition file.
pub fn for_partition(cfg: &RunConfig, layout: &RunLayout, partition: &Partition) -> Invocation {
    let cwd = layout.task_work_dir(&partition.id);
    let output = cwd.join("output.json");
    let target = render_pattern(&cfg.target_pattern, ITEM_KEYWORD);
    let values = Values {
        input: &partition.path,
        output: &output,
        target: &target,
        item: ITEM_KEYWORD,
        threads: cfg.threads,
        wordlist: cfg.wordlist.as_deref(),
    };
    build(cfg, cwd.clone(), output.clone(), &values)
}

/// Invocation for the `index`th item of a partition (shared wordlist mode).
pub fn for_item(
    cfg: &RunConfig,
    layout: &RunLayout,
    partition: &Partition,
    index: usize,
    item: &str,
) -> Invocation {
    let cwd = layout.task_work_dir(&partition.id);
    let output = cwd.join(format!("{index:06}.json"));
    let target = render_pattern(&cfg.target_pattern, item);
    let values = Values {
        input: &partition.path,
        output: &output,
        target: &target,
        item,
        threads: cfg.threads,
        wordlist: cfg.wordlist.as_deref(),
    };
    build(cfg, cwd.clone(), output.clone(), &values)
}

fn build(cfg: &RunConfig, cwd: PathBuf, output: PathBuf, values: &Values<'_>) -> Invocation {
    let templates = if cfg.engine_args.is_empty() {
        default_args(cfg.per_item())
    } else {
        cfg.engine_args.clone()
    };
    let args = templates.iter().map(|t| render(t, values)).collect();
    Invocation {
        program: cfg.engine.clone(),
        args,
        cwd,
        output,
    }
}

fn render_pattern(pattern: &str, item: &str) -> String {
    substitute(pattern, |name| (name == "item").then(|| item.to_string()))
}

fn render(template: &str, v: &Values<'_>) -> String {
    substitute(template, |name| match name {
        "input" => Some(v.input.display().to_string()),
        "output" => Some(v.output.display().to_string()),
        "target" => Some(v.target.to_string()),
        "item" => Some(v.item.to_string()),
        "threads" => Some(v.threads.to_string()),
        "wordlist" => Some(
            v.wordlist
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        _ => None,
    })
}

/// Single left-to-right pass; substituted text is never re-scanned.
fn substitute(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Placeholders a template set must reference for the run to be usable.
pub fn missing_placeholders(templates: &[String], per_item: bool) -> Vec<&'static str> {
    let joined = templates.join(" ");
    let mut required = vec!["{output}"];
    if !per_item {
        required.push("{input}");
    }
    required
        .into_iter()
        .filter(|p| !joined.contains(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParallelTool, Strategy};
    use std::time::Duration;

    fn cfg(wordlist: Option<&str>) -> RunConfig {
        let per_item = wordlist.is_some();
        RunConfig {
            source: "/in/domains.txt".into(),
            output_dir: "/out".into(),
            partition_size: 10,
            concurrency: 2,
            threads: 30,
            target_pattern: default_target_pattern(per_item).into(),
            wordlist: wordlist.map(PathBuf::from),
            engine: "ffuf".into(),
            engine_args: Vec::new(),
            refresh_interval: Duration::from_secs(2),
            timeout: None,
            grace_period: Duration::from_secs(5),
            max_retries: 0,
            strategy: Strategy::Pool,
            parallel_tool: ParallelTool::Xargs,
            reap_interval: Duration::from_millis(250),
            verbose: false,
        }
    }

    fn partition() -> Partition {
        Partition {
            id: "01".into(),
            path: "/out/partitions/chunk_01.txt".into(),
            item_count: 10,
        }
    }

    #[test]
    fn partition_mode_uses_keyword_target() {
        let layout = RunLayout::new("/out");
        let inv = for_partition(&cfg(None), &layout, &partition());
        assert_eq!(inv.program, "ffuf");
        assert_eq!(inv.cwd, PathBuf::from("/out/work/chunk_01"));
        assert_eq!(
            inv.args,
            [
                "-w",
                "/out/partitions/chunk_01.txt:ITEM",
                "-u",
                "https://ITEM/.git/config",
                "-t",
                "30",
                "-o",
                "/out/work/chunk_01/output.json",
                "-of",
                "json",
                "-s",
            ]
        );
    }

    #[test]
    fn item_mode_renders_item_into_target() {
        let layout = RunLayout::new("/out");
        let inv = for_item(&cfg(Some("/lists/common.txt")), &layout, &partition(), 3, "a.example");
        assert_eq!(inv.args[1], "/lists/common.txt");
        assert_eq!(inv.args[3], "https://a.example/FUZZ");
        assert_eq!(inv.output, PathBuf::from("/out/work/chunk_01/000003.json"));
    }

    #[test]
    fn hostile_items_stay_one_argument() {
        let layout = RunLayout::new("/out");
        let mut c = cfg(Some("/w.txt"));
        c.engine_args = vec!["--url={target}".into(), "{output}".into()];
        let item = "x.com; rm -rf / {output}";
        let inv = for_item(&c, &layout, &partition(), 0, item);
        assert_eq!(inv.args.len(), 2);
        assert_eq!(inv.args[0], "--url=https://x.com; rm -rf / {output}/FUZZ");
    }

    #[test]
    fn unknown_and_unbalanced_braces_pass_through() {
        assert_eq!(
            substitute("{a} {nope} {", |n| (n == "a").then(|| "1".to_string())),
            "1 {nope} {"
        );
    }

    #[test]
    fn required_placeholders_are_checked() {
        let none: Vec<String> = vec!["-x".into()];
        assert_eq!(missing_placeholders(&none, false), ["{output}", "{input}"]);
        assert!(missing_placeholders(&default_args(false), false).is_empty());
        assert!(missing_placeholders(&default_args(true), true).is_empty());
    }
}
