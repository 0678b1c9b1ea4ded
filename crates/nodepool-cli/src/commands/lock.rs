use nodepool_core::NodepoolConfig;
use nodepool_lock::{LockClient, LockQuery, StaleLockScanner};

use super::print_json;

pub struct ListFilter {
    pub locked: Option<bool>,
    pub machine_type: Option<String>,
    pub owner: Option<String>,
}

impl ListFilter {
    fn query(&self) -> LockQuery {
        let mut query = LockQuery::new();
        if let Some(locked) = self.locked {
            query = query.locked(locked);
        }
        if let Some(machine_type) = &self.machine_type {
            query = query.machine_type(machine_type);
        }
        if let Some(owner) = &self.owner {
            query = query.param("locked_by", owner);
        }
        query
    }
}

pub async fn status(config: &NodepoolConfig, names: &[String]) -> anyhow::Result<()> {
    let client = LockClient::from_config(config);
    print_json(&client.get_statuses(names).await)
}

pub async fn list(config: &NodepoolConfig, filter: &ListFilter, by_name: bool) -> anyhow::Result<()> {
    let client = LockClient::from_config(config);
    let query = filter.query();
    if by_name {
        print_json(&client.list_locks_by_name(&query).await)
    } else {
        print_json(&client.list_locks(&query).await)
    }
}

pub async fn is_vm(config: &NodepoolConfig, name: &str) -> anyhow::Result<()> {
    let client = LockClient::from_config(config);
    print_json(&client.is_vm(Some(name), None).await?)
}

pub async fn stale(config: &NodepoolConfig, owner: Option<&str>) -> anyhow::Result<()> {
    let scanner = StaleLockScanner::from_config(config);
    print_json(&scanner.find_stale_locks(owner).await)
}
