// Firewall rule store

//! Firewall data store and iptables script generation
//!
//! The store is a tagged-line file holding chain policies, options, lines
//! run before any rule, and per-chain default and user rules. Edits in
//! progress live in a staged copy under the work directory, which is read in
//! preference to the committed store until the user commits or cancels.
//!
//! Only user rules are ever edited. A chain's rules are emitted into the
//! script only when its policy is `DROP`.

use crate::codec;
use crate::error::{NotFound, ValidationError};
use crate::exec::{self, FIREWALL_INIT, RM};
use crate::flags::TransactionFlag;
use crate::form::{self, Form};
use crate::store::Store;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const TAG_IFACE_MATCH: &str = "INTERFACE-MATCH";
const TAG_OPTION: &str = "OPTION";
const TAG_PRE: &str = "PRE";
const TAG_POLICY: &str = "POLICY";
const TAG_DEFAULT_RULE: &str = "DEFAULT-RULE";
const TAG_USER_RULE: &str = "USER-RULE";

const STORE_HEADER: &str = "#\n# Firewall data store for at-cgi\n#\n\n\
# PRE - Always executed first\n\
# POLICY-<chain> - Chain policy definition\n\
# DEFAULT-ACCEPT-RULE-<chain> - An accept rule to always apply first\n\
# USER-ACCEPT-RULE-<chain> - A user defined accept rule\n\
# OPTION-<option> - A specific option\n\
# INTERFACE-MATCH - Strings that match interfaces that may be specified\n\n";

const SCRIPT_HEADER: &str = "#\n# iptables firewall script (filter table)\n# Produced by at-cgi\n#\n\n";

/// Rule flag recording how the port was chosen; never passed to iptables
pub const PORT_SELECTION: &str = "port-sel-typ";
/// Port picked from the well-known service list
pub const PORT_WELL_KNOWN: &str = "wk";
/// Port typed in directly
pub const PORT_DIRECT: &str = "direct";

/// Option enabling packet forwarding between interfaces
pub const OPTION_IP_FORWARD: &str = "IP_FORWARD";

/// Most rows one delete request acts on
pub const MAX_SELECTED_ROWS: usize = 20;

// Form element names
const FIELD_IP_FORWARD: &str = "firewall_ip_forwd";
const FIELD_RULE_CHAIN: &str = "firewall_rule_chain";
const FIELD_RULE_NUMBER: &str = "firewall_rule_rule_number";
const FIELD_RULE_PROTOCOL: &str = "firewall_rule_protocol";
const FIELD_RULE_SERVICE: &str = "firewall_rule_service";
const FIELD_RULE_WELL_KNOWN: &str = "firewall_rule_well_know";
const FIELD_RULE_PORT: &str = "firewall_rule_port";
const FIELD_RULE_IFACE_IN: &str = "firewall_rule_iface_in";
const FIELD_RULE_IFACE_OUT: &str = "firewall_rule_iface_out";
const PROTOCOL_TCP: &str = "firewall_rule_protocol_tcp";
const PROTOCOL_UDP: &str = "firewall_rule_protocol_udp";
const SERVICE_WELL_KNOWN: &str = "firewall_rule_service_well_know";
const ANY_IFACE: &str = "Any";

/// Filter table chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// Traffic addressed to the device
    Input,
    /// Traffic leaving the device
    Output,
    /// Traffic routed through the device
    Forward,
}

impl Chain {
    /// Every chain in store order
    pub const ALL: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];

    /// iptables chain name
    pub fn name(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }

    /// Chain for an iptables chain name
    pub fn from_name(name: &str) -> Option<Self> {
        Chain::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Short name used by the rule form; anything unknown is the forward chain
    pub fn from_form_key(key: &str) -> Self {
        match key {
            "IN" => Chain::Input,
            "OUT" => Chain::Output,
            _ => Chain::Forward,
        }
    }

    fn index(&self) -> usize {
        match self {
            Chain::Input => 0,
            Chain::Output => 1,
            Chain::Forward => 2,
        }
    }

    fn form_stem(&self) -> &'static str {
        match self {
            Chain::Input => "in",
            Chain::Output => "out",
            Chain::Forward => "forwd",
        }
    }

    /// Prefix of the row checkboxes in the rule table
    pub fn row_prefix(&self) -> String {
        format!("firewall_row_{}_", self.form_stem())
    }

    fn policy_field(&self) -> String {
        format!("firewall_{}_policy", self.form_stem())
    }
}

/// One rule: ordered `(flag, value)` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule(pub Vec<(String, String)>);

impl Rule {
    /// Append a `(flag, value)` pair
    pub fn push(&mut self, flag: &str, value: &str) {
        self.0.push((flag.to_string(), value.to_string()));
    }

    /// Value of the first pair with `flag`
    pub fn get(&self, flag: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
    }

    fn parse(text: &str) -> Option<Self> {
        let pairs = codec::parse_pairs(text);
        if pairs.is_empty() {
            None
        } else {
            Some(Self(pairs))
        }
    }

    fn render(&self) -> String {
        codec::render_pairs(self.0.iter().map(|(f, v)| (f.as_str(), v.as_str())))
    }

    /// iptables arguments, without the UI-only port selection flag
    pub fn to_args(&self) -> String {
        self.0
            .iter()
            .filter(|(flag, _)| flag != PORT_SELECTION)
            .map(|(flag, value)| format!("{} {}", flag, value))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Direct port entries must be digits, `:` or `!`; ICMP has no port
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.get("-p") == Some("icmp") {
            return Ok(());
        }
        if self.get(PORT_SELECTION) != Some(PORT_DIRECT) {
            return Ok(());
        }

        let port = self.get("--dport").unwrap_or_default();
        if form::is_blank(port) {
            return Err(ValidationError::new("port", "Please enter a port number"));
        }
        if !port.chars().all(|c| c.is_ascii_digit() || c == ':' || c == '!') {
            return Err(ValidationError::new(
                "port",
                "Please enter a valid port number (: and ! may also be used)",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChainRules {
    default: Vec<Rule>,
    user: Vec<Rule>,
}

/// Parsed firewall data store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallConfig {
    /// Substrings naming interfaces a rule may be bound to
    pub iface_matches: Vec<String>,
    /// `(name, value)` options in file order
    pub options: Vec<(String, String)>,
    /// Shell lines run before any policy or rule
    pub pre: Vec<String>,
    /// `(chain, policy)` in file order
    pub policies: Vec<(String, String)>,
    rules: [ChainRules; 3],
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
}

impl FirewallConfig {
    /// Parse the tagged-line store; unknown lines are skipped
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();

        for line in codec::tagged_lines(text) {
            if let Some(value) = codec::tagged_value(line, TAG_PRE) {
                config.pre.push(value.to_string());
            } else if let Some(value) = codec::tagged_value(line, TAG_IFACE_MATCH) {
                config.iface_matches.push(value.to_string());
            } else if let Some((name, value)) = codec::tagged_pair(line, TAG_OPTION) {
                config.options.push((name.to_string(), value.to_string()));
            } else if let Some((name, value)) = codec::tagged_pair(line, TAG_POLICY) {
                config.policies.push((name.to_string(), value.to_string()));
            } else if let Some((name, value)) = codec::tagged_pair(line, TAG_DEFAULT_RULE) {
                if let (Some(chain), Some(rule)) = (Chain::from_name(name), Rule::parse(value)) {
                    config.rules[chain.index()].default.push(rule);
                }
            } else if let Some((name, value)) = codec::tagged_pair(line, TAG_USER_RULE) {
                if let (Some(chain), Some(rule)) = (Chain::from_name(name), Rule::parse(value)) {
                    config.rules[chain.index()].user.push(rule);
                }
            } else if !line.is_empty() {
                log::debug!("Skipping unknown firewall store line: {}", line);
            }
        }

        config
    }

    /// `None` when the file is missing or empty
    pub fn load(path: &Path) -> Result<Option<Self>> {
        Ok(codec::read_optional(path)?
            .filter(|text| !text.is_empty())
            .map(|text| Self::parse(&text)))
    }

    /// The staged copy if there is one, else the committed store
    pub fn load_auto(store: &Store) -> Result<Self> {
        let paths = store.paths();
        let staged = paths.firewall_staged();
        let path = if staged.exists() {
            log::debug!("Using staged firewall config");
            staged
        } else {
            paths.firewall_store.clone()
        };
        Self::load(&path)?.ok_or_else(|| NotFound(path).into())
    }

    /// Read-only rules applied before the user's
    pub fn default_rules(&self, chain: Chain) -> &[Rule] {
        &self.rules[chain.index()].default
    }

    /// User rules in positional order
    pub fn user_rules(&self, chain: Chain) -> &[Rule] {
        &self.rules[chain.index()].user
    }

    /// Policy of `chain`, if the store sets one
    pub fn policy(&self, chain: Chain) -> Option<&str> {
        self.policies
            .iter()
            .find(|(name, _)| name == chain.name())
            .map(|(_, policy)| policy.as_str())
    }

    /// Set the policy of `chain`
    pub fn set_policy(&mut self, chain: Chain, policy: &str) {
        set_pair(&mut self.policies, chain.name(), policy);
    }

    /// Value of option `name`
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set option `name`, keeping its position
    pub fn set_option(&mut self, name: &str, value: &str) {
        set_pair(&mut self.options, name, value);
    }

    /// Append a user rule to `chain`
    pub fn add_rule(&mut self, chain: Chain, rule: Rule) {
        self.rules[chain.index()].user.push(rule);
    }

    /// Replace the user rule at `index`; an index past the end is an error
    pub fn replace_rule(&mut self, chain: Chain, index: usize, rule: Rule) -> Result<()> {
        let slot = self.rules[chain.index()]
            .user
            .get_mut(index)
            .with_context(|| format!("No {} rule at position {}", chain.name(), index))?;
        *slot = rule;
        Ok(())
    }

    /// Remove and return the user rule at `index`
    pub fn delete_rule(&mut self, chain: Chain, index: usize) -> Result<Rule> {
        let rules = &mut self.rules[chain.index()].user;
        if index >= rules.len() {
            anyhow::bail!("No {} rule at position {}", chain.name(), index);
        }
        Ok(rules.remove(index))
    }

    /// Delete several rules given by their positions before any deletion
    ///
    /// `rows` must be ascending; each one shifts down by the number of rules
    /// already removed.
    pub fn delete_rules(&mut self, chain: Chain, rows: &[usize]) -> Result<()> {
        for (deleted, row) in rows.iter().enumerate() {
            let index = row
                .checked_sub(deleted)
                .with_context(|| format!("Rows to delete are not ascending: {:?}", rows))?;
            self.delete_rule(chain, index)?;
        }
        Ok(())
    }

    /// Apply the policy and options part of the firewall form
    pub fn apply_policy_form(&mut self, form: &Form) {
        for chain in [Chain::Input, Chain::Output] {
            self.set_policy(chain, policy_from_form(form, chain));
        }
        let forward = if form.get(FIELD_IP_FORWARD).is_some() {
            "yes"
        } else {
            "no"
        };
        self.set_option(OPTION_IP_FORWARD, forward);
        self.set_policy(Chain::Forward, policy_from_form(form, Chain::Forward));
    }

    /// Data store text
    pub fn render(&self) -> String {
        let mut out = String::from(STORE_HEADER);

        for m in &self.iface_matches {
            out.push_str(&format!("{}:{}\n", TAG_IFACE_MATCH, m));
        }
        out.push('\n');

        for (name, value) in &self.options {
            out.push_str(&format!("{}-{}:{}\n", TAG_OPTION, name, value));
        }
        out.push('\n');

        for line in &self.pre {
            out.push_str(&format!("{}:{}\n", TAG_PRE, line));
        }
        out.push('\n');

        for (name, value) in &self.policies {
            out.push_str(&format!("{}-{}:{}\n", TAG_POLICY, name, value));
        }
        out.push('\n');

        for chain in Chain::ALL {
            let rules = &self.rules[chain.index()];
            for (tag, list) in [(TAG_DEFAULT_RULE, &rules.default), (TAG_USER_RULE, &rules.user)] {
                for rule in list {
                    out.push_str(&format!("{}-{}:{}\n", tag, chain.name(), rule.render()));
                }
                out.push('\n');
            }
        }

        out
    }

    /// Shell script for the firewall init script to source
    ///
    /// `$IPT` is left for the sourcing script to define.
    pub fn render_script(&self) -> String {
        let mut out = String::from(SCRIPT_HEADER);

        out.push_str("# Options\n\n");
        for (name, value) in &self.options {
            out.push_str(&format!("{}={}\n", name, value));
        }
        out.push('\n');

        out.push_str("# Pre-rule configuration\n\n");
        for line in &self.pre {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');

        out.push_str("# Filter table policies\n\n");
        for (name, policy) in &self.policies {
            out.push_str(&format!("$IPT -P {} {}\n", name, policy));
        }
        out.push('\n');

        for chain in Chain::ALL {
            if self.policy(chain) != Some("DROP") {
                continue;
            }
            let title = match chain {
                Chain::Input => "Input",
                Chain::Output => "Output",
                Chain::Forward => "Forward",
            };
            let rules = &self.rules[chain.index()];
            for (kind, list) in [("default", &rules.default), ("user set", &rules.user)] {
                out.push_str(&format!("# {} chain rules - {}\n\n", title, kind));
                for rule in list {
                    out.push_str(&format!("$IPT -A {} {}\n", chain.name(), rule.to_args()));
                }
                out.push('\n');
            }
        }

        out
    }
}

fn policy_from_form(form: &Form, chain: Chain) -> &'static str {
    let field = chain.policy_field();
    if form.text(&field) == format!("{}_accept", field) {
        "ACCEPT"
    } else {
        "DROP"
    }
}

/// A rule submitted through the rule form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRequest {
    /// Chain the rule belongs to
    pub chain: Chain,
    /// Position of the rule being edited, `None` when the form carried no
    /// usable number
    pub index: Option<usize>,
    /// The rule itself
    pub rule: Rule,
}

/// Build a rule from the rule form
///
/// Every rule built here ends with `-j ACCEPT`.
pub fn parse_rule_form(form: &Form) -> RuleRequest {
    let chain = Chain::from_form_key(&form.text(FIELD_RULE_CHAIN));
    let index = form.text(FIELD_RULE_NUMBER).trim().parse().ok();

    let mut rule = Rule::default();
    let protocol = match form.text(FIELD_RULE_PROTOCOL).as_str() {
        PROTOCOL_TCP => "tcp",
        PROTOCOL_UDP => "udp",
        _ => "icmp",
    };
    rule.push("-p", protocol);

    if protocol != "icmp" {
        let (selection, port) = if form.text(FIELD_RULE_SERVICE) == SERVICE_WELL_KNOWN {
            (PORT_WELL_KNOWN, form.text(FIELD_RULE_WELL_KNOWN))
        } else {
            (PORT_DIRECT, form.text(FIELD_RULE_PORT))
        };
        rule.push(PORT_SELECTION, selection);
        rule.push("--dport", &port);
    }

    for (field, flag) in [(FIELD_RULE_IFACE_IN, "-i"), (FIELD_RULE_IFACE_OUT, "-o")] {
        if let Some(iface) = form.get(field) {
            if iface != ANY_IFACE {
                rule.push(flag, iface);
            }
        }
    }

    rule.push("-j", "ACCEPT");

    RuleRequest { chain, index, rule }
}

/// Positions of the ticked rows of one chain, unique, ascending and capped
///
/// Names that spell the same number (`_1` and `_01`) select one row.
pub fn selected_rows(form: &Form, chain: Chain) -> Vec<usize> {
    let prefix = chain.row_prefix();
    let rows: BTreeSet<usize> = form
        .names_with_prefix(&prefix)
        .filter_map(|name| name[prefix.len()..].parse().ok())
        .collect();
    rows.into_iter().take(MAX_SELECTED_ROWS).collect()
}

/// Write the staged copy; it lives in the work area so needs no privilege
pub fn stage(store: &Store, config: &FirewallConfig) -> Result<()> {
    let paths = store.paths();
    fs::create_dir_all(&paths.work_dir).context("Failed to create work directory")?;
    fs::write(paths.firewall_staged(), config.render()).context("Failed to stage firewall config")
}

/// Script the current configuration would produce, staged edits included
///
/// Nothing is written; the installed script changes only on commit.
pub fn script(store: &Store) -> Result<String> {
    Ok(FirewallConfig::load_auto(store)?.render_script())
}

/// Drop the staged copy without touching the committed store
pub async fn cancel(store: &Store) -> Result<()> {
    let staged = store.paths().firewall_staged();
    if !staged.exists() {
        return Ok(());
    }
    let staged = staged.to_string_lossy().into_owned();
    exec::exec_checked(store.runner(), &[RM, staged.as_str()])
        .await
        .context("Failed to remove staged firewall data store")?;
    log::info!("Discarded staged firewall changes");
    Ok(())
}

/// Make `config` live
///
/// The store is published first; the staged copy is only removed once that
/// has succeeded.
pub async fn commit(store: &Store, config: &FirewallConfig) -> Result<()> {
    let paths = store.paths();

    store
        .publish(&paths.firewall_store, &config.render())
        .await
        .context("Failed to dump firewall config")?;

    cancel(store).await?;

    store
        .publish(&paths.firewall_script, &config.render_script())
        .await
        .context("Failed to dump firewall script")?;

    exec::sudo(store.runner(), &[FIREWALL_INIT])
        .await
        .context("Failed to run firewall script")?;

    store.flags().set_or_log(TransactionFlag::UnsavedSettings);
    log::info!("Firewall updated");
    Ok(())
}

/// Policy form submitted with "update": apply it on top of pending edits and
/// commit
pub async fn update(store: &Store, form: &Form) -> Result<()> {
    let mut config = FirewallConfig::load_auto(store)?;
    config.apply_policy_form(form);
    commit(store, &config).await
}

/// Keep the policy form while the user moves to the rule editor
pub fn stage_policy(store: &Store, form: &Form) -> Result<FirewallConfig> {
    let mut config = FirewallConfig::load_auto(store)?;
    config.apply_policy_form(form);
    stage(store, &config)?;
    Ok(config)
}

/// Whether a rule form adds a new rule or replaces an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    /// Append a rule
    Add,
    /// Replace the rule at the submitted index
    Replace,
}

/// Validate the rule form and stage the result
pub fn save_rule(store: &Store, form: &Form, mode: RuleMode) -> Result<RuleRequest> {
    let mut config = FirewallConfig::load_auto(store)?;

    let request = parse_rule_form(form);
    request.rule.validate()?;

    match mode {
        RuleMode::Add => config.add_rule(request.chain, request.rule.clone()),
        RuleMode::Replace => {
            let index = request
                .index
                .ok_or_else(|| ValidationError::new(FIELD_RULE_NUMBER, "Invalid rule number"))?;
            config.replace_rule(request.chain, index, request.rule.clone())?
        }
    }

    stage(store, &config)?;
    Ok(request)
}

/// Delete the ticked rows of `chain`, keeping the policy form
///
/// Returns how many rules were deleted; nothing is staged when no row was
/// ticked.
pub fn delete_selected(store: &Store, form: &Form, chain: Chain) -> Result<usize> {
    let rows = selected_rows(form, chain);
    if rows.is_empty() {
        return Ok(0);
    }

    let mut config = FirewallConfig::load_auto(store)?;
    config.apply_policy_form(form);
    config
        .delete_rules(chain, &rows)
        .context("Failed to delete rule list")?;
    stage(store, &config)?;
    Ok(rows.len())
}
