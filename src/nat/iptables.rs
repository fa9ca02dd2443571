//! iptables-backed rule store

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{NatError, NatRuleStore, EGRESS_CHAIN, LOCAL_CHAIN};

const POSTROUTING: &str = "POSTROUTING";

/// iptables exits with 1 when a checked rule or listed chain does not exist
const EXIT_NOT_FOUND: i32 = 1;

/// Command output for testability
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command succeeded
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Runs iptables against the `nat` table (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IptablesRunner: Send + Sync {
    /// Run one invocation; `args` start at the command flag (`-A`, `-S`, ...)
    async fn run(&self, args: &[String]) -> Result<CommandOutput, NatError>;
}

/// Runner that executes the real binary
#[derive(Clone, Debug)]
pub struct SystemIptables {
    program: PathBuf,
}

impl SystemIptables {
    /// Use the iptables binary at `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl IptablesRunner for SystemIptables {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, NatError> {
        let mut cmd = Command::new(&self.program);
        // -w waits for the xtables lock instead of failing
        cmd.args(["-w", "-t", "nat"]).args(args);
        debug!(command = ?cmd, "executing iptables");

        let output = cmd.output().await.map_err(|source| NatError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        Ok(CommandOutput::from(output))
    }
}

/// [`NatRuleStore`] over an [`IptablesRunner`]
pub struct IptablesRuleStore<R: IptablesRunner = SystemIptables> {
    runner: R,
}

impl IptablesRuleStore<SystemIptables> {
    /// Create a store that shells out to `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_runner(SystemIptables::new(program))
    }
}

fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

fn accept_spec(local_ip: IpAddr, owner: &str) -> Vec<String> {
    args([
        "-s",
        local_ip.to_string().as_str(),
        "-m",
        "comment",
        "--comment",
        owner,
        "-j",
        "ACCEPT",
    ])
}

impl<R: IptablesRunner> IptablesRuleStore<R> {
    /// Create a store with a custom runner
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    /// Run and require success
    async fn exec(&self, argv: Vec<String>) -> Result<CommandOutput, NatError> {
        let out = self.runner.run(&argv).await?;
        if out.success {
            Ok(out)
        } else {
            Err(NatError::Command {
                command: argv.join(" "),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Run a query where exit code 1 means "no"
    async fn query(&self, argv: Vec<String>) -> Result<bool, NatError> {
        let out = self.runner.run(&argv).await?;
        match (out.success, out.code) {
            (true, _) => Ok(true),
            (false, Some(EXIT_NOT_FOUND)) => Ok(false),
            (false, code) => Err(NatError::Command {
                command: argv.join(" "),
                code,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    async fn chain_exists(&self, chain: &str) -> Result<bool, NatError> {
        self.query(args(["-S", chain])).await
    }

    async fn rule_exists(&self, chain: &str, spec: &[String]) -> Result<bool, NatError> {
        let mut argv = args(["-C", chain]);
        argv.extend_from_slice(spec);
        self.query(argv).await
    }

    async fn insert_unique(&self, chain: &str, spec: &[String]) -> Result<(), NatError> {
        if self.rule_exists(chain, spec).await? {
            return Ok(());
        }
        let mut argv = args(["-I", chain, "1"]);
        argv.extend_from_slice(spec);
        self.exec(argv).await.map(|_| ())
    }

    async fn append(&self, chain: &str, spec: &[String]) -> Result<(), NatError> {
        let mut argv = args(["-A", chain]);
        argv.extend_from_slice(spec);
        self.exec(argv).await.map(|_| ())
    }

    async fn append_unique(&self, chain: &str, spec: &[String]) -> Result<(), NatError> {
        if self.rule_exists(chain, spec).await? {
            return Ok(());
        }
        self.append(chain, spec).await
    }

    /// Create `chain`, or flush it if it already exists
    async fn reset_chain(&self, chain: &str) -> Result<(), NatError> {
        let flag = if self.chain_exists(chain).await? {
            "-F"
        } else {
            "-N"
        };
        self.exec(args([flag, chain])).await.map(|_| ())
    }

    /// Rule specs of `chain`, without the leading `-A <chain>`
    async fn list_rules(&self, chain: &str) -> Result<Vec<Vec<String>>, NatError> {
        let out = self.exec(args(["-S", chain])).await?;
        let mut rules = Vec::new();
        for line in out.stdout.lines() {
            let tokens = split_rule(line)?;
            if tokens.len() > 2 && tokens[0] == "-A" && tokens[1] == chain {
                rules.push(tokens[2..].to_vec());
            }
        }
        Ok(rules)
    }
}

/// Split one `iptables -S` line into arguments, honouring double quotes
pub(crate) fn split_rule(line: &str) -> Result<Vec<String>, NatError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(NatError::Parse(line.to_string())),
            },
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(NatError::Parse(line.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn comment_of(spec: &[String]) -> Option<&str> {
    spec.windows(2)
        .find(|w| w[0] == "--comment")
        .map(|w| w[1].as_str())
}

#[async_trait]
impl<R: IptablesRunner> NatRuleStore for IptablesRuleStore<R> {
    async fn setup(&self, allowed_destinations: &[IpNet]) -> Result<(), NatError> {
        if !self.chain_exists(EGRESS_CHAIN).await? {
            self.exec(args(["-N", EGRESS_CHAIN])).await?;
        }
        self.append_unique(EGRESS_CHAIN, &args(["-j", "RETURN"]))
            .await?;

        self.reset_chain(LOCAL_CHAIN).await?;
        for dest in allowed_destinations {
            if let IpNet::V6(_) = dest {
                warn!(destination = %dest, "skipping IPv6 destination");
                continue;
            }
            self.append_unique(LOCAL_CHAIN, &args(["-d", dest.to_string().as_str(), "-j", "RETURN"]))
                .await?;
        }
        self.append(LOCAL_CHAIN, &args(["-j", EGRESS_CHAIN])).await?;
        self.append(LOCAL_CHAIN, &args(["-j", "RETURN"])).await?;

        self.insert_unique(POSTROUTING, &args(["-j", LOCAL_CHAIN]))
            .await?;

        info!(
            destinations = allowed_destinations.len(),
            "egress NAT chains ready"
        );
        Ok(())
    }

    async fn ensure(&self, local_ip: IpAddr, owner: &str) -> Result<(), NatError> {
        if local_ip.is_ipv6() {
            return Err(NatError::Unsupported(format!(
                "{local_ip} (iptables handles IPv4 only)"
            )));
        }
        // Inserted at the top so the chain's trailing RETURN stays last
        self.insert_unique(EGRESS_CHAIN, &accept_spec(local_ip, owner))
            .await?;
        debug!(owner = %owner, local_ip = %local_ip, "egress rule present");
        Ok(())
    }

    async fn remove(&self, owner: &str) -> Result<(), NatError> {
        for spec in self.list_rules(EGRESS_CHAIN).await? {
            if comment_of(&spec) != Some(owner) {
                continue;
            }
            let mut argv = args(["-D", EGRESS_CHAIN]);
            argv.extend(spec);
            self.exec(argv).await?;
            debug!(owner = %owner, "egress rule removed");
        }
        Ok(())
    }
}
