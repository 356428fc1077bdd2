//! Maintenance subcommands over the entry store. Output is one JSON object
//! per line so it pipes into `jq`.

use clap::Args;
use sensord_scheduler::{
    ActionRegistry, NewScheduleEntry, ScheduleStore, SqliteStore, SystemClock, Tick,
};
use serde_json::to_string;

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Unique slug: letters, digits, '-' or '_'
    #[arg(long)]
    pub name: String,

    /// Registered action to run
    #[arg(long)]
    pub action: String,

    /// Lower runs first when tasks share a tick [default: 10]
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i32>,

    /// First tick, inclusive [default: now + 1]
    #[arg(long, allow_negative_numbers = true)]
    pub start: Option<Tick>,

    /// Last tick, exclusive [default: never]
    #[arg(long, allow_negative_numbers = true)]
    pub stop: Option<Tick>,

    /// Treat --stop as an offset from --start
    #[arg(long)]
    pub relative_stop: bool,

    /// Ticks between tasks [default: run once]
    #[arg(long)]
    pub interval: Option<i64>,

    /// POST each task result here
    #[arg(long)]
    pub callback_url: Option<String>,

    /// Opaque owner reference
    #[arg(long)]
    pub owner: Option<String>,
}

impl From<AddArgs> for NewScheduleEntry {
    fn from(args: AddArgs) -> Self {
        NewScheduleEntry {
            name: args.name,
            action: args.action,
            priority: args.priority,
            start: args.start,
            stop: args.stop,
            stop_is_relative: args.relative_stop,
            interval: args.interval,
            callback_url: args.callback_url,
            owner: args.owner,
        }
    }
}

pub fn add(store: &SqliteStore, args: AddArgs) -> anyhow::Result<()> {
    let entry = NewScheduleEntry::from(args)
        .into_entry(&SystemClock, &ActionRegistry::with_builtins())?;
    store.insert_entry(&entry)?;
    println!("{}", to_string(&entry)?);
    Ok(())
}

pub fn list(store: &SqliteStore) -> anyhow::Result<()> {
    for entry in store.list_entries()? {
        println!("{}", to_string(&entry)?);
    }
    Ok(())
}

pub fn cancel(store: &SqliteStore, name: &str) -> anyhow::Result<()> {
    store.deactivate(name)?;
    Ok(())
}

pub fn remove(store: &SqliteStore, name: &str) -> anyhow::Result<()> {
    store.delete_entry(name)?;
    Ok(())
}

pub fn results(store: &SqliteStore, name: &str, limit: usize) -> anyhow::Result<()> {
    // distinguish "no results yet" from a typo in the name
    store.get_entry(name)?;
    for result in store.list_results(name, limit)? {
        println!("{}", to_string(&result)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        add: AddArgs,
    }

    #[test]
    fn add_args_accept_negative_ticks() {
        let cli = TestCli::try_parse_from([
            "sensord", "--name", "scan", "--action", "logger", "--start", "-10", "--stop", "5",
            "--interval", "1",
        ])
        .unwrap();
        let new = NewScheduleEntry::from(cli.add);
        assert_eq!(new.start, Some(-10));
        assert_eq!(new.stop, Some(5));
        assert!(!new.stop_is_relative);
    }

    #[test]
    fn add_then_cancel_then_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        let args = AddArgs {
            name: "scan".to_string(),
            action: "logger".to_string(),
            priority: None,
            start: Some(100),
            stop: Some(50),
            relative_stop: true,
            interval: Some(10),
            callback_url: None,
            owner: None,
        };
        add(&store, args).unwrap();
        let entry = store.get_entry("scan").unwrap();
        assert_eq!(entry.stop, Some(150));

        cancel(&store, "scan").unwrap();
        assert!(!store.get_entry("scan").unwrap().is_active);

        remove(&store, "scan").unwrap();
        assert!(results(&store, "scan", 10).is_err());
    }

    #[test]
    fn add_rejects_unknown_action() {
        let store = SqliteStore::open_in_memory().unwrap();
        let args = AddArgs {
            name: "scan".to_string(),
            action: "no_such_action".to_string(),
            priority: None,
            start: None,
            stop: None,
            relative_stop: false,
            interval: None,
            callback_url: None,
            owner: None,
        };
        assert!(add(&store, args).is_err());
        assert!(store.list_entries().unwrap().is_empty());
    }
}
