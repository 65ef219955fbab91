//! Persistent, concurrently read policy store
//!
//! Mutations are applied to a copy, persisted, and only then committed.
//! Every commit rebuilds the per-agent rule index, bumps the generation
//! counter and re-synchronizes the target pool while the write lock is held.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::validate::{check_policy, check_policy_header, check_rule};
use super::{Policy, PolicyError, PolicyKind, Rule, RuleKey};

/// Resources opened per target, kept in step with the rules that reference them
pub trait TargetPool: Send + Sync {
    /// Called after each commit with every target referenced by an enabled rule
    fn sync_targets(&self, targets: &BTreeSet<String>);
}

#[derive(Default)]
struct PolicyState {
    policies: Vec<Policy>,
    index: HashMap<String, Arc<[Rule]>>,
}

pub struct PolicyStore {
    kind: PolicyKind,
    path: Option<PathBuf>,
    state: RwLock<PolicyState>,
    generation: AtomicU64,
    pool: Option<Arc<dyn TargetPool>>,
}

impl PolicyStore {
    /// Store without a backing file
    pub fn in_memory(kind: PolicyKind) -> Self {
        Self {
            kind,
            path: None,
            state: RwLock::new(PolicyState::default()),
            generation: AtomicU64::new(0),
            pool: None,
        }
    }

    /// Load the store from `path`; a missing file starts empty, a malformed one is an error
    pub fn open(kind: PolicyKind, path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let policies = load_policies(kind, &path)?;
        info!(
            "Loaded {} {} policies from {}",
            policies.len(),
            kind,
            path.display()
        );

        let store = Self {
            path: Some(path),
            ..Self::in_memory(kind)
        };
        store.commit(&mut store.state.write(), policies);
        Ok(store)
    }

    /// Attach the pool synchronized on every commit and sync it once
    pub fn with_pool(mut self, pool: Arc<dyn TargetPool>) -> Self {
        pool.sync_targets(&referenced_targets(&self.state.read().policies));
        self.pool = Some(pool);
        self
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Incremented on every committed mutation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.state.read().policies.clone()
    }

    pub fn policy(&self, policy_id: &str) -> Option<Policy> {
        self.state
            .read()
            .policies
            .iter()
            .find(|p| p.policy_id == policy_id)
            .cloned()
    }

    /// Enabled rules whose source is `agent`
    pub fn rules_for(&self, agent: &str) -> Option<Arc<[Rule]>> {
        self.state.read().index.get(agent).cloned()
    }

    /// Run `f` over the enabled rules of `agent` under the read lock; `f`
    /// must not block or mutate this store
    pub fn with_rules<T>(&self, agent: &str, f: impl FnOnce(&[Rule]) -> T) -> Option<T> {
        let state = self.state.read();
        state.index.get(agent).map(|rules| f(rules))
    }

    pub fn len(&self) -> usize {
        self.state.read().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of policies after the insert
    pub fn add_policy(&self, mut policy: Policy) -> Result<usize, PolicyError> {
        check_policy(self.kind, &policy)?;
        inherit_targets(&mut policy);
        info!(
            "Add {} policy {} targets {:?} with {} rules",
            self.kind,
            policy.policy_id,
            policy.targets,
            policy.rules.len()
        );
        self.mutate(|policies| {
            if policies.iter().any(|p| p.policy_id == policy.policy_id) {
                return Err(PolicyError::DuplicatePolicy(policy.policy_id));
            }
            policies.push(policy);
            Ok(policies.len())
        })
    }

    /// Replaces ID, targets and enable flag; rules are kept. Returns 1.
    pub fn update_policy(&self, policy_id: &str, update: Policy) -> Result<usize, PolicyError> {
        check_policy_header(self.kind, &update)?;
        self.mutate(|policies| {
            let index = position(policies, policy_id)?;
            if update.policy_id != policy_id
                && policies.iter().any(|p| p.policy_id == update.policy_id)
            {
                return Err(PolicyError::DuplicatePolicy(update.policy_id));
            }
            let policy = &mut policies[index];
            policy.policy_id = update.policy_id;
            policy.targets = update.targets;
            policy.enable = update.enable;
            Ok(1)
        })
    }

    /// Returns the index the policy was removed from
    pub fn delete_policy(&self, policy_id: &str) -> Result<usize, PolicyError> {
        self.mutate(|policies| {
            let index = position(policies, policy_id)?;
            policies.remove(index);
            Ok(index)
        })
    }

    /// Returns the policy's rule count after the insert
    pub fn add_rule(&self, policy_id: &str, rule: Rule) -> Result<usize, PolicyError> {
        check_rule(&rule)?;
        self.mutate(|policies| {
            let index = position(policies, policy_id)?;
            let policy = &mut policies[index];
            let key = rule.key();
            if policy.rules.iter().any(|r| key.matches(r)) {
                return Err(PolicyError::DuplicateRule);
            }
            policy.rules.push(rule);
            Ok(policy.rules.len())
        })
    }

    /// Removes the rule with the same (source, port, direction); returns the remaining count
    pub fn delete_rule(&self, policy_id: &str, key: &RuleKey) -> Result<usize, PolicyError> {
        self.mutate(|policies| {
            let index = position(policies, policy_id)?;
            let policy = &mut policies[index];
            let Some(rule_index) = policy.rules.iter().position(|r| key.matches(r)) else {
                return Err(PolicyError::UnknownRule {
                    policy_id: policy_id.to_string(),
                    rule: key.to_string(),
                });
            };
            policy.rules.remove(rule_index);
            Ok(policy.rules.len())
        })
    }

    pub fn delete_rule_by_id(&self, policy_id: &str, rule_id: &str) -> Result<usize, PolicyError> {
        let key = RuleKey::parse(rule_id)?;
        self.delete_rule(policy_id, &key)
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<Policy>) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        let mut state = self.state.write();
        let mut next = state.policies.clone();
        let out = change(&mut next)?;
        for policy in &mut next {
            inherit_targets(policy);
        }
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        self.commit(&mut state, next);
        if let Some(pool) = &self.pool {
            pool.sync_targets(&referenced_targets(&state.policies));
        }
        Ok(out)
    }

    fn commit(&self, state: &mut PolicyState, policies: Vec<Policy>) {
        let mut index: HashMap<String, Vec<Rule>> = HashMap::new();
        for policy in policies.iter().filter(|p| p.enable) {
            for rule in &policy.rules {
                index.entry(rule.source.clone()).or_default().push(rule.clone());
            }
        }
        state.index = index
            .into_iter()
            .map(|(agent, rules)| (agent, Arc::from(rules)))
            .collect();
        state.policies = policies;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "{} policy index rebuilt: {} agents, generation {}",
            self.kind,
            state.index.len(),
            generation
        );
    }
}

fn position(policies: &[Policy], policy_id: &str) -> Result<usize, PolicyError> {
    policies
        .iter()
        .position(|p| p.policy_id == policy_id)
        .ok_or_else(|| PolicyError::UnknownPolicy(policy_id.to_string()))
}

fn inherit_targets(policy: &mut Policy) {
    for rule in &mut policy.rules {
        rule.targets.clone_from(&policy.targets);
    }
}

fn referenced_targets(policies: &[Policy]) -> BTreeSet<String> {
    policies
        .iter()
        .filter(|p| p.enable && !p.rules.is_empty())
        .flat_map(|p| p.targets.iter().cloned())
        .collect()
}

fn load_policies(kind: PolicyKind, path: &Path) -> Result<Vec<Policy>, PolicyError> {
    let load_error = |reason: String| PolicyError::Load {
        path: path.display().to_string(),
        reason,
    };
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("No {} policy file at {}, starting empty", kind, path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(load_error(e.to_string())),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let mut policies: Vec<Policy> =
        serde_json::from_slice(&data).map_err(|e| load_error(e.to_string()))?;
    for policy in &mut policies {
        check_policy(kind, policy).map_err(|e| load_error(e.to_string()))?;
        inherit_targets(policy);
    }
    Ok(policies)
}

/// Write to a sibling temp file and rename it into place
fn persist(path: &Path, policies: &[Policy]) -> Result<(), PolicyError> {
    let persist_error = |reason: String| PolicyError::Persist {
        path: path.display().to_string(),
        reason,
    };
    let json = serde_json::to_vec_pretty(policies).map_err(|e| persist_error(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(|e| persist_error(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| persist_error(e.to_string()))
}
