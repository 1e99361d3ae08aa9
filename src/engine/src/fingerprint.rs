//! Cache keys for build steps.
//!
//! A fingerprint covers the parent layer, the config state the step starts
//! from, the canonical instruction text, the values of the build arguments
//! the instruction references (in declaration order) and the digest of
//! every file input. Arguments the instruction does not reference are left
//! out, so changing them does not invalidate the step.

use crate::digest::{Digest, FieldHasher};
use crate::script::Instruction;
use crate::store::layer::LayerId;

const DOMAIN: &str = "kiln.fingerprint.v1";

/// A build argument in scope, with its resolved value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValue {
    pub name: String,
    pub value: Option<String>,
}

/// Accumulates the inputs of one step.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    parent: Option<LayerId>,
    state: Digest,
    canonical: String,
    args: Vec<ArgValue>,
    inputs: Vec<(String, Digest)>,
}

impl Fingerprinter {
    /// Start from the current top layer and config state.
    pub fn new(parent: Option<&LayerId>, state: &Digest, instruction: &Instruction) -> Self {
        Self {
            parent: parent.cloned(),
            state: state.clone(),
            canonical: instruction.canonical_form(),
            args: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Keep the arguments of `in_scope` (declaration order) that the
    /// instruction references.
    pub fn args(mut self, in_scope: &[ArgValue], referenced: &[String]) -> Self {
        self.args = in_scope
            .iter()
            .filter(|a| referenced.contains(&a.name))
            .cloned()
            .collect();
        self
    }

    /// A file input: the path as named by the instruction, and its digest.
    pub fn input(&mut self, path: impl Into<String>, digest: Digest) -> &mut Self {
        self.inputs.push((path.into(), digest));
        self
    }

    pub fn finish(&self) -> Digest {
        let mut hasher = FieldHasher::new(DOMAIN);
        match &self.parent {
            Some(parent) => hasher.str_field(parent.digest().as_str()),
            None => hasher.none(),
        };
        hasher.str_field(self.state.as_str());
        hasher.str_field(&self.canonical);
        hasher.field(&(self.args.len() as u64).to_be_bytes());
        for arg in &self.args {
            hasher.str_field(&arg.name);
            match &arg.value {
                Some(v) => hasher.str_field(v),
                None => hasher.none(),
            };
        }
        hasher.field(&(self.inputs.len() as u64).to_be_bytes());
        for (path, digest) in &self.inputs {
            hasher.str_field(path).str_field(digest.as_str());
        }
        hasher.finish()
    }
}
