//! Remote shell command construction.
//!
//! Every bulk operation funnels through `ShellBatch`, which takes structured
//! statements and emits remote calls chunked under a bounded size, so one
//! host with hundreds of ports never exceeds the remote shell's argument
//! list limit. Keeping the chunking and quoting here means the call sites
//! never concatenate shell strings by hand.

/// Accumulates shell statements and emits them in bounded chunks.
///
/// An optional prelude (environment exports, `mkdir -p` of a target
/// directory) is repeated at the front of every chunk, since each chunk is
/// an independent remote invocation.
#[derive(Debug, Clone)]
pub struct ShellBatch {
    prelude: Option<String>,
    statements: Vec<String>,
    chunk_size: usize,
}

impl ShellBatch {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            prelude: None,
            statements: Vec::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Prepends a statement to every emitted chunk.
    pub fn with_prelude(mut self, prelude: impl Into<String>) -> Self {
        self.prelude = Some(prelude.into());
        self
    }

    pub fn push(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Joins the statements into one command per chunk.
    pub fn chunks(&self) -> Vec<String> {
        self.statements
            .chunks(self.chunk_size)
            .map(|chunk| {
                let mut parts: Vec<&str> = Vec::with_capacity(chunk.len() + 1);
                if let Some(ref prelude) = self.prelude {
                    parts.push(prelude);
                }
                parts.extend(chunk.iter().map(String::as_str));
                parts.join(" ")
            })
            .collect()
    }
}

/// Quotes a string for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Joins environment variable pairs into an export prelude.
pub fn env_exports(vars: &[(&str, String)]) -> String {
    let parts: Vec<String> = vars
        .iter()
        .map(|(key, value)| format!("export {key}={};", sh_quote(value)))
        .collect();
    parts.join(" ")
}

/// Alternation matching any of the given ports in a process table line,
/// e.g. `(:18100|:18101)`.
fn port_alternation(ports: &[u16]) -> String {
    let parts: Vec<String> = ports.iter().map(|p| format!(":{p}")).collect();
    format!("({})", parts.join("|"))
}

/// Pipeline listing `flare-server` processes that serve any of `ports`.
///
/// Processes are matched by listening port in the process table rather than
/// by pid file, so crash-restarted processes are still found. When
/// `cluster_id` is given the match is narrowed to the invoking user's
/// processes of that cluster.
pub fn ps_list_command(ports: &[u16], cluster_id: Option<&str>) -> String {
    let mut stages = vec!["ps -ef".to_string(), "grep 'flare-server'".to_string()];
    if let Some(id) = cluster_id {
        stages.push("grep `whoami`".into());
        stages.push(format!("grep 'cluster_{id}'"));
    }
    stages.push(format!("grep -E '{}'", port_alternation(ports)));
    stages.push("grep -v 'ps -ef'".into());
    stages.push("grep -v 'grep'".into());
    stages.join(" | ")
}

/// Command counting matching processes.
pub fn ps_count_command(ports: &[u16], cluster_id: Option<&str>) -> String {
    format!("{} | wc -l", ps_list_command(ports, cluster_id))
}

/// Command signalling every process that serves any of `ports`.
pub fn kill_command(ports: &[u16], force: bool) -> String {
    let signal = if force { "SIGKILL" } else { "SIGINT" };
    format!(
        "kill -s {signal} $({} | awk '{{print $2}}')",
        ps_list_command(ports, None)
    )
}

/// Exit statuses `kill_command` may legitimately return: the process table
/// can change between listing and signalling, and an empty pid list is not a
/// failure during shutdown.
pub const KILL_ALLOWED_STATUSES: &[i32] = &[0, 1, 2, 123, 130];

/// Command listing the local addresses of listening TCP sockets.
pub const LISTENING_PORTS_COMMAND: &str = "netstat -tnl | grep LISTEN | awk '{print $4}'";
