// Path: crates/master/src/jobs/local.rs
//! The built-in on-disk returner.
//!
//! Layout, one directory per jid:
//!
//! ```text
//! <cache_dir>/jobs/<YY>/<MM>/<jid>/jid               the job load
//! <cache_dir>/jobs/<YY>/<MM>/<jid>/<MinionID>/return one file per return
//! ```

use super::returner::Returner;
use async_trait::async_trait;
use herd_types::codec;
use herd_types::error::{CoreError, InternalError};
use herd_types::job::{Job, Return};
use herd_types::{JobId, MinionId};
use std::path::PathBuf;

/// The `local_cache` returner.
pub struct LocalCacheReturner {
    root: PathBuf,
}

fn io_err(ctx: &str, e: impl std::fmt::Display) -> CoreError {
    InternalError::Io(format!("{}: {}", ctx, e)).into()
}

impl LocalCacheReturner {
    /// A returner rooted at `<cache_dir>/jobs`.
    pub fn new(cache_dir: &std::path::Path) -> Self {
        Self {
            root: cache_dir.join("jobs"),
        }
    }

    fn jid_dir(&self, jid: &JobId) -> Result<PathBuf, CoreError> {
        let (yy, mm) = jid
            .cache_prefix()
            .ok_or_else(|| io_err("jid dir", format!("malformed jid: {}", jid)))?;
        Ok(self.root.join(yy).join(mm).join(jid.as_str()))
    }
}

#[async_trait]
impl Returner for LocalCacheReturner {
    async fn prep_jid(&self, job: &Job) -> Result<(), CoreError> {
        let dir = self.jid_dir(&job.jid)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("prep jid", e))
    }

    async fn save_load(&self, jid: &JobId, job: &Job) -> Result<(), CoreError> {
        let dir = self.jid_dir(jid)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("save load", e))?;
        let bytes = codec::to_bytes(job).map_err(CoreError::from)?;
        tokio::fs::write(dir.join("jid"), bytes)
            .await
            .map_err(|e| io_err("save load", e))
    }

    async fn save_return(&self, jid: &JobId, ret: &Return) -> Result<(), CoreError> {
        if !ret.id.is_path_safe() {
            return Err(io_err("save return", format!("unusable id: {:?}", ret.id.as_str())));
        }
        let dir = self.jid_dir(jid)?.join(ret.id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("save return", e))?;
        let bytes = codec::to_bytes(ret).map_err(CoreError::from)?;
        tokio::fs::write(dir.join("return"), bytes)
            .await
            .map_err(|e| io_err("save return", e))
    }

    async fn get_load(&self, jid: &JobId) -> Result<Option<Job>, CoreError> {
        let path = self.jid_dir(jid)?.join("jid");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(codec::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("get load", e)),
        }
    }

    async fn get_return(&self, jid: &JobId, id: &MinionId) -> Result<Option<Return>, CoreError> {
        let path = self.jid_dir(jid)?.join(id.as_str()).join("return");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(codec::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("get return", e)),
        }
    }

    async fn get_jids(&self) -> Result<Vec<JobId>, CoreError> {
        let mut out = Vec::new();
        let mut years = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err("get jids", e)),
        };
        while let Some(year) = years.next_entry().await.map_err(|e| io_err("get jids", e))? {
            let mut months = match tokio::fs::read_dir(year.path()).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Some(month) = months
                .next_entry()
                .await
                .map_err(|e| io_err("get jids", e))?
            {
                let mut jids = match tokio::fs::read_dir(month.path()).await {
                    Ok(rd) => rd,
                    Err(_) => continue,
                };
                while let Some(jid) =
                    jids.next_entry().await.map_err(|e| io_err("get jids", e))?
                {
                    if let Some(name) = jid.file_name().to_str() {
                        out.push(JobId::from_existing(name));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herd_types::target::TargetSpec;
    use serde_json::{json, Map};

    fn job(jid: &str) -> Job {
        Job {
            jid: JobId::from_existing(jid),
            target: TargetSpec::glob("*"),
            fun: "test.echo".into(),
            arg: vec![json!("hi")],
            kwarg: Map::new(),
            user: "root".into(),
            timestamp: Utc::now(),
            ret: None,
        }
    }

    const JID: &str = "20260801120000123456deadbeef";

    #[tokio::test]
    async fn test_load_and_return_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let returner = LocalCacheReturner::new(dir.path());
        let job = job(JID);
        let jid = job.jid.clone();

        returner.prep_jid(&job).await.unwrap();
        returner.save_load(&jid, &job).await.unwrap();

        let ret = Return {
            jid: jid.clone(),
            id: MinionId::new("m1"),
            retcode: 0,
            ret: json!("hi"),
            success: true,
            fun: "test.echo".into(),
            stamp: Utc::now(),
        };
        returner.save_return(&jid, &ret).await.unwrap();

        // The layout is part of the contract.
        assert!(dir
            .path()
            .join("jobs/26/08")
            .join(JID)
            .join("jid")
            .exists());
        assert!(dir
            .path()
            .join("jobs/26/08")
            .join(JID)
            .join("m1/return")
            .exists());

        let load = returner.get_load(&jid).await.unwrap().unwrap();
        assert_eq!(load.fun, "test.echo");
        let got = returner
            .get_return(&jid, &MinionId::new("m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, ret);
        assert_eq!(returner.get_jids().await.unwrap(), vec![jid]);
    }

    #[tokio::test]
    async fn test_missing_entries_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let returner = LocalCacheReturner::new(dir.path());
        let jid = JobId::from_existing(JID);
        assert!(returner.get_load(&jid).await.unwrap().is_none());
        assert!(returner
            .get_return(&jid, &MinionId::new("m1"))
            .await
            .unwrap()
            .is_none());
        assert!(returner.get_jids().await.unwrap().is_empty());
    }
}
