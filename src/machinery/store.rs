use anyhow::{Context, Result};
use heed::{
    Database, Env, EnvOpenOptions,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use tokio::fs::create_dir_all;

/// A document kept in the store under `<collection>/<name>`.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn record_name(&self) -> &str;
}

fn record_key<D: Record>(name: &str) -> String {
    format!("{}/{}", D::COLLECTION, name)
}

// trailing separator keeps "machine" from matching "machines"
fn collection_prefix<D: Record>() -> String {
    format!("{}/", D::COLLECTION)
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if !dir_path.exists() {
            create_dir_all(dir_path).await?;
        }

        let env = unsafe { EnvOpenOptions::new().open(dir_path)? };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    pub fn get<D: Record>(&self, name: &str) -> Result<Option<D>> {
        let key = record_key::<D>(name);
        let rtxn = self.env.read_txn()?;
        let Some(value) = self.db.get(&rtxn, &key)? else {
            return Ok(None);
        };

        let value =
            serde_json::from_slice(value).with_context(|| format!("corrupt value under {key}"))?;
        Ok(Some(value))
    }

    pub fn list<D: Record>(&self) -> Result<Vec<D>> {
        let mut values = Vec::new();
        self.for_each(|_, value: D| values.push(value))?;
        Ok(values)
    }

    /// Visits every record of the collection in key order, passing the record name.
    pub fn for_each<D: Record>(&self, mut f: impl FnMut(&str, D)) -> Result<()> {
        let prefix = collection_prefix::<D>();
        let rtxn = self.env.read_txn()?;

        for entry in self.db.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = entry?;
            let value: D =
                serde_json::from_slice(v).with_context(|| format!("corrupt value under {k}"))?;
            f(&k[prefix.len()..], value);
        }
        Ok(())
    }

    pub fn list_keys<D: Record>(&self) -> Result<Vec<String>> {
        let prefix = collection_prefix::<D>();
        let rtxn = self.env.read_txn()?;

        let mut keys = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &prefix)? {
            let (k, _) = entry?;
            keys.push(k[prefix.len()..].to_string());
        }
        Ok(keys)
    }

    pub fn put<D: Record>(&self, value: &D) -> Result<()> {
        let key = record_key::<D>(value.record_name());
        let value = serde_json::to_vec(value)?;

        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &key, &value)?;
        wtxn.commit()?;

        Ok(())
    }

    pub fn delete<D: Record>(&self, name: &str) -> Result<bool> {
        let key = record_key::<D>(name);
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.db.delete(&mut wtxn, &key)?;
        wtxn.commit()?;

        Ok(deleted)
    }
}
