//! Built-in collector modules

pub mod adaptecraid;
pub mod elasticsearch;
pub mod mq;
pub mod ping;
pub mod systemdunits;
pub mod zookeeper;

use crate::confgroup::Defaults;
use crate::registry::{Creator, Registry, RegistryError};

fn every(update_every: u64) -> Defaults {
    Defaults {
        update_every,
        ..Defaults::default()
    }
}

/// Register every built-in module
pub fn register_all(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register("adaptecraid", Creator::new(adaptecraid::AdaptecRaid::new).with_defaults(every(10)))?;
    registry.register("elasticsearch", Creator::new(elasticsearch::Elasticsearch::new).with_defaults(every(5)))?;
    registry.register("mq", Creator::new(mq::Mq::new))?;
    registry.register("ping", Creator::new(ping::Ping::new).with_defaults(every(5)))?;
    registry.register("systemdunits", Creator::new(systemdunits::SystemdUnits::new).with_defaults(every(10)))?;
    registry.register("zookeeper", Creator::new(zookeeper::Zookeeper::new))?;
    Ok(())
}

/// Registry holding the built-in modules
pub fn builtin_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    register_all(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::clients::{ClientFactory, ClientSet};
    use crate::confgroup::JobConfig;
    use crate::module::{Charts, JobContext, Module};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Context for driving a module by hand with the given client factory
    pub fn context(module: &dyn Module, config: JobConfig, factory: Arc<dyn ClientFactory>) -> JobContext {
        let clients = ClientSet::new(factory, module.capabilities(), config.module.clone());
        JobContext::new(config, CancellationToken::new(), clients)
    }

    /// Module's declared charts, admitted the way the runner admits them
    pub fn declared(module: &dyn Module) -> Charts {
        let mut charts = Charts::new();
        charts.add_all(module.charts()).unwrap();
        charts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_register_all() {
        let registry = builtin_registry().unwrap();
        assert_eq!(
            registry.names(),
            vec!["adaptecraid", "elasticsearch", "mq", "ping", "systemdunits", "zookeeper"]
        );
        assert_eq!(registry.get("systemdunits").unwrap().defaults.update_every, 10);
        assert_eq!(registry.get("zookeeper").unwrap().defaults.update_every, 1);

        let mut again = Registry::new();
        register_all(&mut again).unwrap();
        assert!(register_all(&mut again).is_err());
    }

    #[test]
    fn test_context_names_are_unique() {
        let all = [
            adaptecraid::contexts::CONTEXTS,
            mq::contexts::CONTEXTS,
            ping::contexts::CONTEXTS,
            systemdunits::contexts::CONTEXTS,
        ];
        let registry = builtin_registry().unwrap();
        let mut seen = HashSet::new();
        for def in all.iter().flat_map(|defs| defs.iter()) {
            assert!(seen.insert(def.context), "duplicate context {}", def.context);
            let module = def.context.split('.').next().unwrap();
            assert!(registry.contains(module), "context {} has no module", def.context);
        }
    }
}
