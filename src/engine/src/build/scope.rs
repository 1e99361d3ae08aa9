//! Build argument scopes.
//!
//! ARGs declared before the first FROM are global: they are visible in FROM
//! lines only, unless a stage redeclares them. A stage ARG takes its value
//! from `--build-arg` first, then from its own default, then from the global
//! declaration of the same name.

use std::collections::BTreeMap;

use kiln_core::error::Result;

use crate::fingerprint::ArgValue;
use crate::script::expand::process_word;
use crate::script::ArgDecl;

/// Resolve global ARGs in declaration order. Defaults may use earlier
/// globals.
pub(crate) fn resolve_meta_args(
    decls: &[ArgDecl],
    build_args: &BTreeMap<String, String>,
    escape: char,
) -> Result<Vec<ArgValue>> {
    let mut resolved: Vec<ArgValue> = Vec::new();
    for decl in decls {
        let value = match build_args.get(&decl.name) {
            Some(v) => Some(v.clone()),
            None => match &decl.default {
                Some(raw) => {
                    let mut lookup = |name: &str| lookup_in(&resolved, name);
                    Some(process_word(raw, escape, &mut lookup)?)
                }
                None => None,
            },
        };
        set(&mut resolved, &decl.name, value);
    }
    Ok(resolved)
}

fn lookup_in(values: &[ArgValue], name: &str) -> Option<String> {
    values
        .iter()
        .find(|a| a.name == name)
        .and_then(|a| a.value.clone())
}

fn set(values: &mut Vec<ArgValue>, name: &str, value: Option<String>) {
    match values.iter_mut().find(|a| a.name == name) {
        Some(existing) => existing.value = value,
        None => values.push(ArgValue {
            name: name.to_string(),
            value,
        }),
    }
}

/// Arguments visible to one stage.
#[derive(Debug, Clone, Default)]
pub(crate) struct ArgScope {
    meta: Vec<ArgValue>,
    declared: Vec<ArgValue>,
}

impl ArgScope {
    pub fn new(meta: Vec<ArgValue>) -> Self {
        Self {
            meta,
            declared: Vec::new(),
        }
    }

    /// Stage arguments in declaration order.
    pub fn declared(&self) -> &[ArgValue] {
        &self.declared
    }

    /// Declare `name`. `default` is the already expanded default value.
    pub fn declare(
        &mut self,
        name: &str,
        default: Option<String>,
        build_args: &BTreeMap<String, String>,
    ) {
        let value = build_args
            .get(name)
            .cloned()
            .or(default)
            .or_else(|| lookup_in(&self.meta, name));
        set(&mut self.declared, name, value);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        lookup_in(&self.declared, name)
    }

    pub fn meta_get(&self, name: &str) -> Option<String> {
        lookup_in(&self.meta, name)
    }

    /// `NAME=value` for every declared argument with a value, in
    /// declaration order.
    pub fn env(&self) -> Vec<(String, String)> {
        self.declared
            .iter()
            .filter_map(|a| a.value.clone().map(|v| (a.name.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, default: Option<&str>) -> ArgDecl {
        ArgDecl {
            name: name.into(),
            default: default.map(String::from),
        }
    }

    #[test]
    fn test_meta_args_chain_and_override() {
        let mut build_args = BTreeMap::new();
        build_args.insert("TAG".to_string(), "3.19".to_string());
        let resolved = resolve_meta_args(
            &[
                decl("REPO", Some("alpine")),
                decl("TAG", Some("latest")),
                decl("IMAGE", Some("${REPO}:$TAG")),
                decl("UNSET", None),
            ],
            &build_args,
            '\\',
        )
        .unwrap();
        assert_eq!(lookup_in(&resolved, "IMAGE").as_deref(), Some("alpine:3.19"));
        assert_eq!(lookup_in(&resolved, "UNSET"), None);
        assert_eq!(resolved.len(), 4);
    }

    #[test]
    fn test_stage_scope_precedence() {
        let meta = vec![ArgValue {
            name: "VERSION".into(),
            value: Some("1".into()),
        }];
        let mut scope = ArgScope::new(meta);
        assert_eq!(scope.get("VERSION"), None);
        assert_eq!(scope.meta_get("VERSION").as_deref(), Some("1"));

        let mut build_args = BTreeMap::new();
        scope.declare("VERSION", None, &build_args);
        assert_eq!(scope.get("VERSION").as_deref(), Some("1"));

        scope.declare("MODE", Some("debug".into()), &build_args);
        build_args.insert("MODE".to_string(), "release".to_string());
        scope.declare("MODE", Some("debug".into()), &build_args);
        assert_eq!(scope.get("MODE").as_deref(), Some("release"));
        assert_eq!(
            scope.env(),
            vec![
                ("VERSION".to_string(), "1".to_string()),
                ("MODE".to_string(), "release".to_string())
            ]
        );
    }
}
