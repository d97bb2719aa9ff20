//! In-memory stand-in for a FreeBSD host
//!
//! [`FakeHost`] answers `zfs`, `jail` and `jls` invocations from an
//! in-memory model of the ZFS tree and the live jail table, so the dataset,
//! bootstrap and lifecycle code can be exercised without ZFS or root. Every
//! other program succeeds unless it was marked failing.

use std::collections::{BTreeMap, HashSet};
use std::process::Output;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::executor::{BoxedExecutor, FakeExecutor, Invocation, failure_output, success_output};

#[derive(Debug, Clone)]
struct FakeDataset {
    snapshot: bool,
    origin: Option<String>,
    props: BTreeMap<String, String>,
    written: u64,
}

#[derive(Debug, Default)]
struct HostState {
    datasets: BTreeMap<String, FakeDataset>,
    jails: Vec<(u32, String)>,
    next_jid: u32,
    failing_properties: HashSet<String>,
    failing_programs: HashSet<String>,
}

fn missing(name: &str) -> Output {
    failure_output(1, format!("cannot open '{}': dataset does not exist", name))
}

impl HostState {
    fn mountpoint(&self, name: &str) -> String {
        let Some(ds) = self.datasets.get(name) else {
            return "-".to_string();
        };
        if ds.snapshot {
            return "-".to_string();
        }
        if let Some(mp) = ds.props.get("mountpoint") {
            return mp.clone();
        }
        match name.rsplit_once('/') {
            Some((parent, leaf)) => match self.mountpoint(parent).as_str() {
                "-" | "none" => "-".to_string(),
                parent_mp => format!("{}/{}", parent_mp.trim_end_matches('/'), leaf),
            },
            None => format!("/{}", name),
        }
    }

    fn column(&self, name: &str, column: &str) -> String {
        let Some(ds) = self.datasets.get(name) else {
            return "-".to_string();
        };
        match column {
            "name" => name.to_string(),
            "type" => if ds.snapshot { "snapshot" } else { "filesystem" }.to_string(),
            "mountpoint" => self.mountpoint(name),
            "origin" => ds.origin.clone().unwrap_or_else(|| "-".to_string()),
            "written" => ds.written.to_string(),
            "compression" => ds.props.get("compression").cloned().unwrap_or_else(|| "off".to_string()),
            prop => ds.props.get(prop).cloned().unwrap_or_else(|| "-".to_string()),
        }
    }

    /// Split `-o a=b` pairs off the front of `args`
    fn options<'a>(args: &'a [&'a str]) -> (BTreeMap<String, String>, &'a [&'a str]) {
        let mut props = BTreeMap::new();
        let mut rest = args;
        while let ["-o", kv, tail @ ..] = rest {
            if let Some((k, v)) = kv.split_once('=') {
                props.insert(k.to_string(), v.to_string());
            }
            rest = tail;
        }
        (props, rest)
    }

    fn zfs(&mut self, args: &[&str]) -> Output {
        match args {
            ["list", rest @ ..] => {
                let mut columns = vec!["name"];
                let mut target = None;
                let mut iter = rest.iter();
                while let Some(arg) = iter.next() {
                    match *arg {
                        "-o" => columns = iter.next().map(|c| c.split(',').collect()).unwrap_or_default(),
                        "-t" => {
                            iter.next();
                        }
                        flag if flag.starts_with('-') => {}
                        name => target = Some(name),
                    }
                }
                let names: Vec<String> = match target {
                    Some(name) => {
                        if !self.datasets.contains_key(name) {
                            return missing(name);
                        }
                        vec![name.to_string()]
                    }
                    None => self.datasets.keys().cloned().collect(),
                };
                let mut out = String::new();
                for name in names {
                    let row: Vec<String> = columns.iter().map(|c| self.column(&name, c)).collect();
                    out.push_str(&row.join("\t"));
                    out.push('\n');
                }
                success_output(out)
            }
            ["get", "-H", "-p", "-o", "value", key, name] => {
                if self.failing_properties.contains(*key) {
                    return failure_output(1, format!("cannot get property '{}': permission denied", key));
                }
                if !self.datasets.contains_key(*name) {
                    return missing(name);
                }
                success_output(format!("{}\n", self.column(name, key)))
            }
            ["set", assignment, name] => {
                let Some((key, value)) = assignment.split_once('=') else {
                    return failure_output(2, "bad property assignment");
                };
                if self.failing_properties.contains(key) {
                    return failure_output(1, format!("cannot set property for '{}': permission denied", name));
                }
                let Some(ds) = self.datasets.get_mut(*name) else {
                    return missing(name);
                };
                ds.props.insert(key.to_string(), value.to_string());
                success_output("")
            }
            ["create", rest @ ..] => {
                let (props, rest) = Self::options(rest);
                let [name] = rest else {
                    return failure_output(2, "usage: zfs create");
                };
                if self.datasets.contains_key(*name) {
                    return failure_output(1, format!("cannot create '{}': dataset already exists", name));
                }
                if let Some((parent, _)) = name.rsplit_once('/') {
                    if !self.datasets.contains_key(parent) {
                        return failure_output(1, format!("cannot create '{}': parent does not exist", name));
                    }
                }
                self.datasets.insert(
                    name.to_string(),
                    FakeDataset { snapshot: false, origin: None, props, written: 0 },
                );
                success_output("")
            }
            ["snapshot", full] => {
                let Some((dataset, _)) = full.split_once('@') else {
                    return failure_output(2, "usage: zfs snapshot");
                };
                if self.datasets.contains_key(*full) {
                    return failure_output(1, format!("cannot create snapshot '{}': dataset already exists", full));
                }
                let Some(ds) = self.datasets.get_mut(dataset) else {
                    return missing(dataset);
                };
                ds.written = 0;
                self.datasets.insert(
                    full.to_string(),
                    FakeDataset { snapshot: true, origin: None, props: BTreeMap::new(), written: 0 },
                );
                success_output("")
            }
            ["clone", rest @ ..] => {
                let (props, rest) = Self::options(rest);
                let [snapshot, destination] = rest else {
                    return failure_output(2, "usage: zfs clone");
                };
                if !self.datasets.get(*snapshot).is_some_and(|d| d.snapshot) {
                    return missing(snapshot);
                }
                if self.datasets.contains_key(*destination) {
                    return failure_output(1, format!("cannot create '{}': dataset already exists", destination));
                }
                self.datasets.insert(
                    destination.to_string(),
                    FakeDataset {
                        snapshot: false,
                        origin: Some(snapshot.to_string()),
                        props,
                        written: 0,
                    },
                );
                success_output("")
            }
            ["destroy", name] => {
                if !self.datasets.contains_key(*name) {
                    return missing(name);
                }
                let child_prefix = format!("{}/", name);
                let snap_prefix = format!("{}@", name);
                if self
                    .datasets
                    .keys()
                    .any(|k| k.starts_with(&child_prefix) || k.starts_with(&snap_prefix))
                {
                    return failure_output(1, format!("cannot destroy '{}': filesystem has children", name));
                }
                if self.datasets.values().any(|d| d.origin.as_deref() == Some(*name)) {
                    return failure_output(1, format!("cannot destroy '{}': snapshot has dependent clones", name));
                }
                self.datasets.remove(*name);
                success_output("")
            }
            _ => failure_output(2, format!("unsupported zfs invocation: {}", args.join(" "))),
        }
    }

    fn jail(&mut self, args: &[&str]) -> Output {
        match args {
            ["-c", params @ ..] => {
                let Some(name) = params.iter().find_map(|p| p.strip_prefix("name=")) else {
                    return failure_output(1, "jail: missing name");
                };
                if self.jails.iter().any(|(_, n)| n == name) {
                    return failure_output(1, format!("jail: create: \"{}\" already exists", name));
                }
                self.next_jid += 1;
                self.jails.push((self.next_jid, name.to_string()));
                success_output(format!("{}: created\n", name))
            }
            ["-r", jid] => {
                let before = self.jails.len();
                self.jails.retain(|(j, _)| j.to_string() != *jid);
                if self.jails.len() == before {
                    return failure_output(1, format!("jail: \"{}\" not found", jid));
                }
                success_output("")
            }
            _ => failure_output(2, "usage: jail"),
        }
    }

    fn jls(&self) -> Output {
        let mut out = String::from("jid name\n");
        for (jid, name) in &self.jails {
            out.push_str(&format!("{} {}\n", jid, name));
        }
        success_output(out)
    }

    fn handle(&mut self, invocation: &Invocation) -> Output {
        let args = invocation.args();
        let subcommand = args.first().map(|first| format!("{} {}", invocation.program, first));
        if self.failing_programs.contains(&invocation.program)
            || subcommand.is_some_and(|s| self.failing_programs.contains(&s))
        {
            return failure_output(1, format!("{}: simulated failure", invocation.program));
        }
        match invocation.program.as_str() {
            "zfs" => self.zfs(&args),
            "jail" => self.jail(&args),
            "jls" => self.jls(),
            _ => success_output(""),
        }
    }
}

/// Simulated host backed by a [`FakeExecutor`]
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
    executor: Arc<FakeExecutor>,
}

impl FakeHost {
    /// A host with a single pool named `zroot`
    pub fn new() -> Self {
        Self::with_pool("zroot")
    }

    pub fn with_pool(pool: &str) -> Self {
        let mut state = HostState::default();
        state.datasets.insert(
            pool.to_string(),
            FakeDataset { snapshot: false, origin: None, props: BTreeMap::new(), written: 0 },
        );
        let state = Arc::new(Mutex::new(state));

        let executor = FakeExecutor::new();
        let handler_state = Arc::clone(&state);
        executor.set_handler(Box::new(move |invocation| {
            handler_state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle(invocation)
        }));

        Self { state, executor }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn executor(&self) -> BoxedExecutor {
        Arc::clone(&self.executor).as_executor()
    }

    /// Every command run against this host so far
    pub fn invocations(&self) -> Vec<Invocation> {
        self.executor.invocations()
    }

    /// Names of all datasets and snapshots
    pub fn dataset_names(&self) -> Vec<String> {
        self.state().datasets.keys().cloned().collect()
    }

    pub fn property(&self, dataset: &str, key: &str) -> Option<String> {
        let state = self.state();
        state.datasets.get(dataset)?;
        Some(state.column(dataset, key))
    }

    /// Record a write to `dataset`, as if a file changed inside it
    pub fn touch(&self, dataset: &str) {
        if let Some(ds) = self.state().datasets.get_mut(dataset) {
            ds.written += 4096;
        }
    }

    /// Make every `zfs get`/`zfs set` of `key` fail
    pub fn fail_property(&self, key: &str) {
        self.state().failing_properties.insert(key.to_string());
    }

    /// Make every invocation of `program` fail.
    ///
    /// `program` may carry its first argument too, e.g. `"zfs snapshot"`.
    pub fn fail_program(&self, program: &str) {
        self.state().failing_programs.insert(program.to_string());
    }

    /// `(jid, name)` of every live jail
    pub fn running_jails(&self) -> Vec<(String, String)> {
        self.state()
            .jails
            .iter()
            .map(|(jid, name)| (jid.to_string(), name.clone()))
            .collect()
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}
