//! Dependency-level scheduling
//!
//! A step depends on every step it lists in `depends_on` and on every step
//! whose name appears as a base image in its build file. Steps are grouped
//! into levels: level 0 has no dependencies, level N holds the steps whose
//! deepest dependency sits in level N-1.

use crate::dockerfile::{base_images, parse, Directives};
use crate::error::ScheduleError;
use crate::manifest::Manifest;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use tracing::debug;

/// Levels of step indices into the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub levels: Vec<Vec<usize>>,
    /// Direct dependencies of each step, by manifest index
    pub dependencies: Vec<Vec<usize>>,
}

impl Schedule {
    pub fn level_of(&self, step: usize) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(&step))
    }

    pub fn step_names<'a>(&self, manifest: &'a Manifest) -> Vec<Vec<&'a str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| manifest.steps[i].name.as_str()).collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Reads every step's build file and computes the schedule.
pub fn schedule(manifest: &Manifest, workdir: &Path) -> Result<Schedule, ScheduleError> {
    let dependencies = compute_dependencies(manifest, workdir)?;
    let levels = build_levels(manifest, &dependencies)?;
    debug!("Scheduled {} steps into {} levels", manifest.len(), levels.len());
    Ok(Schedule {
        levels,
        dependencies,
    })
}

/// Direct dependencies of every step, in manifest order.
pub fn compute_dependencies(
    manifest: &Manifest,
    workdir: &Path,
) -> Result<Vec<Vec<usize>>, ScheduleError> {
    manifest
        .steps
        .iter()
        .map(|step| {
            let path = workdir.join(&step.dockerfile);
            let content = std::fs::read_to_string(&path).map_err(|source| ScheduleError::Io {
                step: step.name.clone(),
                path: path.clone(),
                source,
            })?;
            let parsed = parse(&content, Directives::default()).map_err(|source| ScheduleError::Parse {
                step: step.name.clone(),
                source,
            })?;

            let mut deps = BTreeSet::new();
            for reference in &step.depends_on {
                let idx = manifest.resolve_reference(reference).ok_or_else(|| {
                    ScheduleError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: reference.clone(),
                    }
                })?;
                deps.insert(idx);
            }
            for image in base_images(&parsed.ast) {
                if let Some(idx) = manifest.position(image) {
                    deps.insert(idx);
                }
            }
            Ok(deps.into_iter().collect())
        })
        .collect()
}

/// Groups steps into levels, keeping manifest order inside a level.
pub fn build_levels(
    manifest: &Manifest,
    dependencies: &[Vec<usize>],
) -> Result<Vec<Vec<usize>>, ScheduleError> {
    let count = manifest.len();
    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

    for (step, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            if dep == step {
                return Err(ScheduleError::Cycle {
                    steps: vec![manifest.steps[step].name.clone()],
                });
            }
            in_degree[step] += 1;
            dependents[dep].push(step);
        }
    }

    let mut levels = Vec::new();
    let mut current: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;

    while !current.is_empty() {
        let level: Vec<usize> = current.drain(..).collect();
        let mut next = Vec::new();

        for &step in &level {
            for &dependent in &dependents[step] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }

        placed += level.len();
        levels.push(level);
        next.sort_unstable();
        current.extend(next);
    }

    if placed < count {
        let steps = (0..count)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| manifest.steps[i].name.clone())
            .collect();
        return Err(ScheduleError::Cycle { steps });
    }

    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Step;
    use tempfile::TempDir;

    fn workdir(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn test_linear_chain_three_levels() {
        let dir = workdir(&[
            ("Dockerfile.base", "FROM alpine\n"),
            ("Dockerfile.mid", "FROM base\n"),
            ("Dockerfile.top", "FROM mid\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("top", "Dockerfile.top"),
            Step::new("mid", "Dockerfile.mid"),
            Step::new("base", "Dockerfile.base"),
        ]);

        let schedule = schedule(&manifest, dir.path()).unwrap();
        assert_eq!(
            schedule.step_names(&manifest),
            vec![vec!["base"], vec!["mid"], vec!["top"]]
        );
    }

    #[test]
    fn test_siblings_share_level() {
        let dir = workdir(&[
            ("Dockerfile.base", "FROM alpine\n"),
            ("Dockerfile.a", "FROM base\n"),
            ("Dockerfile.b", "FROM base\nRUN true\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("base", "Dockerfile.base"),
            Step::new("a", "Dockerfile.a"),
            Step::new("b", "Dockerfile.b"),
        ]);

        let schedule = schedule(&manifest, dir.path()).unwrap();
        assert_eq!(schedule.levels, vec![vec![0], vec![1, 2]]);
        assert_eq!(schedule.level_of(2), Some(1));
    }

    #[test]
    fn test_level_is_deepest_dependency_plus_one() {
        let manifest = Manifest::new(vec![
            Step::new("a", "A"),
            Step::new("b", "B"),
            Step::new("c", "C"),
            Step::new("d", "D"),
        ]);
        // d depends on a (level 0) and c (level 2)
        let deps = vec![vec![], vec![0], vec![1], vec![0, 2]];
        let levels = build_levels(&manifest, &deps).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_explicit_dependency_by_label() {
        let dir = workdir(&[("D1", "FROM alpine\n"), ("D2", "FROM debian\n")]);
        let mut first = Step::new("first", "D1");
        first.label = "stage-one".to_string();
        let manifest = Manifest::new(vec![
            Step::new("second", "D2").with_dependency("stage-one"),
            first,
        ]);

        let schedule = schedule(&manifest, dir.path()).unwrap();
        assert_eq!(schedule.levels, vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let dir = workdir(&[("D", "FROM alpine\n")]);
        let manifest = Manifest::new(vec![Step::new("app", "D").with_dependency("ghost")]);

        let err = schedule(&manifest, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::UnknownDependency { ref dependency, .. } if dependency == "ghost"
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let dir = workdir(&[("DA", "FROM b\n"), ("DB", "FROM a\n"), ("DC", "FROM alpine\n")]);
        let manifest = Manifest::new(vec![
            Step::new("a", "DA"),
            Step::new("b", "DB"),
            Step::new("c", "DC"),
        ]);

        let err = schedule(&manifest, dir.path()).unwrap_err();
        match err {
            ScheduleError::Cycle { steps } => assert_eq!(steps, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_rejected() {
        let dir = workdir(&[("D", "FROM app\n")]);
        let manifest = Manifest::new(vec![Step::new("app", "D")]);

        assert!(matches!(
            schedule(&manifest, dir.path()).unwrap_err(),
            ScheduleError::Cycle { .. }
        ));
    }

    #[test]
    fn test_unreadable_build_file() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![Step::new("app", "missing")]);
        assert!(matches!(
            schedule(&manifest, dir.path()).unwrap_err(),
            ScheduleError::Io { .. }
        ));
    }

    #[test]
    fn test_unparsable_build_file() {
        let dir = workdir(&[("D", "FROM alpine\nLABEL a=\"open\n")]);
        let manifest = Manifest::new(vec![Step::new("app", "D")]);
        assert!(matches!(
            schedule(&manifest, dir.path()).unwrap_err(),
            ScheduleError::Parse { .. }
        ));
    }
}
