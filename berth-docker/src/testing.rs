//! In-memory docker engine used by unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use berth_core::error::Result;
use berth_core::ports::parse_port_mapping;

use crate::command::{CommandOutput, CommandRunner, RunOptions};

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub label: String,
    pub image: String,
    pub port_mappings: Vec<String>,
    pub running: bool,
}

#[derive(Default)]
struct Engine {
    next_id: u32,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, String>,
    pull_failures: HashMap<String, u32>,
    health: HashMap<String, VecDeque<String>>,
    failing_removals: HashSet<String>,
    step_exit_code: i32,
    calls: Vec<Call>,
}

/// Simulates just enough of the docker CLI for the backend's calls
#[derive(Default)]
pub struct FakeDocker {
    engine: Mutex<Engine>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: 1,
    }
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` pulls of `image` fail
    pub fn fail_pulls(&self, image: &str, count: u32) {
        self.engine
            .lock()
            .unwrap()
            .pull_failures
            .insert(image.to_string(), count);
    }

    /// Health statuses reported for `image`, one per inspect; the last one repeats
    pub fn health_sequence(&self, image: &str, statuses: &[&str]) {
        self.engine.lock().unwrap().health.insert(
            image.to_string(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// `docker rm` of this id fails with a daemon error
    pub fn fail_removal(&self, id: &str) {
        self.engine
            .lock()
            .unwrap()
            .failing_removals
            .insert(id.to_string());
    }

    pub fn set_step_exit_code(&self, code: i32) {
        self.engine.lock().unwrap().step_exit_code = code;
    }

    /// Adds a container directly, as if left over by an earlier job
    pub fn seed_container(&self, label: &str, image: &str) -> String {
        let mut engine = self.engine.lock().unwrap();
        engine.next_id += 1;
        let id = format!("stale{}", engine.next_id);
        engine.containers.insert(
            id.clone(),
            FakeContainer {
                name: id.clone(),
                label: label.to_string(),
                image: image.to_string(),
                port_mappings: vec![],
                running: true,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<Call> {
        self.engine.lock().unwrap().calls.clone()
    }

    /// Recorded calls whose first non-`--config` argument is `verb`
    pub fn calls_to(&self, verb: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| strip_config(&c.args).first().map(String::as_str) == Some(verb))
            .collect()
    }

    pub fn containers(&self) -> BTreeMap<String, FakeContainer> {
        self.engine.lock().unwrap().containers.clone()
    }

    pub fn containers_labelled(&self, label: &str) -> usize {
        self.containers()
            .values()
            .filter(|c| c.label == label)
            .count()
    }

    pub fn networks_labelled(&self, label: &str) -> usize {
        self.engine
            .lock()
            .unwrap()
            .networks
            .values()
            .filter(|l| *l == label)
            .count()
    }

    fn handle(&self, engine: &mut Engine, args: &[String]) -> CommandOutput {
        let args = strip_config(args);
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or_default();

        match (arg(0), arg(1)) {
            ("login", _) | ("logout", _) | ("build", _) => ok(""),
            ("pull", image) => match engine.pull_failures.get_mut(image) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    fail("toomanyrequests: rate limit exceeded")
                }
                _ => ok(format!("Pulled {}", image)),
            },
            ("network", "create") => {
                engine
                    .networks
                    .insert(arg(4).to_string(), arg(3).to_string());
                ok(arg(4))
            }
            ("network", "rm") => match engine.networks.remove(arg(2)) {
                Some(_) => ok(arg(2)),
                None => fail(format!("Error: No such network: {}", arg(2))),
            },
            ("network", "prune") => {
                let label = arg(4).trim_start_matches("label=").to_string();
                engine.networks.retain(|_, l| *l != label);
                ok("")
            }
            ("create", _) => create(engine, &args[1..]),
            ("start", id) => match engine.containers.get_mut(id) {
                Some(container) => {
                    container.running = true;
                    ok(id)
                }
                None => fail(format!("Error: No such container: {}", id)),
            },
            ("port", id) => match engine.containers.get(id) {
                Some(container) => ok(port_listing(&container.port_mappings)),
                None => fail(format!("Error: No such container: {}", id)),
            },
            ("inspect", format) => {
                // Environment lookups resolve images as well as containers
                if format.contains(".Config.Env") {
                    return ok("'/usr/local/bin:/usr/bin:/bin'\n");
                }
                let Some(container) = engine.containers.get(arg(2)).cloned() else {
                    return fail(format!("Error: No such object: {}", arg(2)));
                };
                let status = match engine.health.get_mut(&container.image) {
                    Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                    Some(queue) => queue.front().cloned().unwrap_or_default(),
                    None => String::new(),
                };
                ok(format!("\"{}\"\n", status))
            }
            ("exec", id) => match engine.containers.get(id) {
                Some(container) if container.image.contains("alpine") => ok(""),
                Some(_) => fail(""),
                None => fail(format!("Error: No such container: {}", id)),
            },
            ("ps", _) => {
                let label = args
                    .last()
                    .map(|f| f.trim_start_matches("label=").to_string())
                    .unwrap_or_default();
                let ids: Vec<&str> = engine
                    .containers
                    .iter()
                    .filter(|(_, c)| c.label == label)
                    .map(|(id, _)| id.as_str())
                    .collect();
                ok(ids.join("\n"))
            }
            ("rm", _) => {
                let mut errors = Vec::new();
                for id in args.iter().skip(2) {
                    if engine.failing_removals.contains(id) {
                        errors.push(format!("Error response from daemon: permission denied: {}", id));
                    } else if engine.containers.remove(id).is_none() {
                        errors.push(format!("Error: No such container: {}", id));
                    }
                }
                if errors.is_empty() {
                    ok("")
                } else {
                    fail(errors.join("\n"))
                }
            }
            (verb, _) => fail(format!("unknown command: {}", verb)),
        }
    }
}

fn strip_config(args: &[String]) -> Vec<String> {
    match args.first().map(String::as_str) {
        Some("--config") => args.iter().skip(2).cloned().collect(),
        _ => args.to_vec(),
    }
}

fn create(engine: &mut Engine, args: &[String]) -> CommandOutput {
    let mut label = String::new();
    let mut name = String::new();
    let mut port_mappings = Vec::new();
    let mut image = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => name = iter.next().cloned().unwrap_or_default(),
            "-p" => port_mappings.extend(iter.next().cloned()),
            "-e" | "-v" | "--entrypoint" => {
                iter.next();
            }
            flag if flag.starts_with("--label=") => {
                label = flag.trim_start_matches("--label=").to_string();
            }
            flag if flag.starts_with('-') => {}
            positional => {
                image = Some(positional.to_string());
                break;
            }
        }
    }

    let Some(image) = image else {
        return fail("\"docker create\" requires at least 1 argument.");
    };

    engine.next_id += 1;
    let id = format!("{:064x}", engine.next_id);
    engine.containers.insert(
        id.clone(),
        FakeContainer {
            name,
            label,
            image,
            port_mappings,
            running: false,
        },
    );
    ok(format!("{}\n", id))
}

fn port_listing(mappings: &[String]) -> String {
    mappings
        .iter()
        .enumerate()
        .filter_map(|(i, m)| parse_port_mapping(m).ok().map(|b| (i, b)))
        .map(|(i, binding)| {
            let host = binding
                .host_port
                .map(u32::from)
                .unwrap_or(32768 + i as u32);
            format!(
                "{}/{} -> 0.0.0.0:{}",
                binding.container_port, binding.protocol, host
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl CommandRunner for FakeDocker {
    async fn output(&self, args: &[String], opts: &RunOptions) -> Result<CommandOutput> {
        let mut engine = self.engine.lock().unwrap();
        engine.calls.push(Call {
            args: args.to_vec(),
            env: opts.env.clone(),
            stdin: opts.stdin.clone(),
        });
        Ok(self.handle(&mut engine, args))
    }

    async fn stream(&self, args: &[String], opts: &RunOptions) -> Result<i32> {
        let mut engine = self.engine.lock().unwrap();
        engine.calls.push(Call {
            args: args.to_vec(),
            env: opts.env.clone(),
            stdin: opts.stdin.clone(),
        });
        Ok(match args.first().map(String::as_str) {
            Some("run") => engine.step_exit_code,
            _ => 0,
        })
    }
}
