//! On-disk program cache keyed by graph, device and configuration.

use crate::config::CompileConfig;
use crate::error::{io_context, ForgeResult, GraphForgeError};
use crate::ir::Graph;
use crate::program::{Program, ProgramBuilder};
use crate::registry::ImplementationRegistry;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const EXTENSION: &str = "gfpc";

#[derive(Debug, Clone)]
pub struct ProgramCache {
    dir: PathBuf,
}

impl ProgramCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Blob path for `graph` built with `config`. Any setting that changes
    /// the program changes the name.
    pub fn path_for(&self, graph: &Graph, config: &CompileConfig) -> ForgeResult<PathBuf> {
        let mut hasher = DefaultHasher::new();
        config.to_json_string()?.hash(&mut hasher);
        Ok(self
            .dir
            .join(format!("{:016x}-{:016x}.{}", graph.fingerprint(), hasher.finish(), EXTENSION)))
    }

    /// Cached program for `graph`, or `None` when there is no blob or the
    /// blob no longer matches.
    pub fn load(
        &self,
        graph: &Graph,
        registry: &ImplementationRegistry,
        config: &CompileConfig,
    ) -> ForgeResult<Option<Program>> {
        let path = self.path_for(graph, config)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_context(e, &format!("reading {}", path.display()))),
        };
        match super::deserialize_for_graph(bytes.as_slice(), registry, config, graph) {
            Ok(program) => {
                debug!(path = %path.display(), "program cache hit");
                Ok(Some(program))
            }
            Err(GraphForgeError::CacheMismatch(reason)) => {
                warn!(path = %path.display(), %reason, "discarding stale program blob");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn store(&self, graph: &Graph, config: &CompileConfig, program: &Program) -> ForgeResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| io_context(e, &format!("creating {}", self.dir.display())))?;
        let path = self.path_for(graph, config)?;
        let mut blob = Vec::new();
        super::serialize(program, &mut blob)?;
        fs::write(&path, blob).map_err(|e| io_context(e, &format!("writing {}", path.display())))?;
        debug!(path = %path.display(), "program cached");
        Ok(path)
    }

    /// Load from the cache or build and store.
    pub fn get_or_build(
        &self,
        graph: &Graph,
        registry: &ImplementationRegistry,
        config: &CompileConfig,
    ) -> ForgeResult<Program> {
        if let Some(program) = self.load(graph, registry, config)? {
            return Ok(program);
        }
        let program = ProgramBuilder::new(registry, config).build(graph)?;
        self.store(graph, config, &program)?;
        Ok(program)
    }
}
