//! Lease store.
//!
//! The control service is the only writer of `dhcp_leases`; gateways report
//! reality through sync results but never touch the store. Uniqueness is
//! enforced by the database, not in-process locks: one lease per
//! `(vps_id, is_public)`, and per-gateway uniqueness of MAC and IP.
//! `vps_instances` and `vps_public_ips` belong to the surrounding system;
//! this store only reads them (plus test seeding helpers).

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::debug;

use fabric_core::error::FabricError;

/// Errors surfaced by the lease store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database itself failed.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// A write would violate a uniqueness invariant.
    #[error("conflicting lease: {0}")]
    Conflict(String),
}

impl From<StoreError> for FabricError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => FabricError::invalid_argument(msg),
            StoreError::Db(e) => FabricError::internal(e.to_string()),
        }
    }
}

/// One row of `dhcp_leases`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LeaseRecord {
    /// Unique lease identifier.
    pub lease_id: String,
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Canonical lowercase colon-separated MAC.
    pub mac_address: String,
    /// Dotted IPv4 address.
    pub ip_address: String,
    /// Gateway that owns this lease.
    pub gateway_node: String,
    /// Public or private scope.
    pub is_public: bool,
    /// Expiry as epoch seconds, when known.
    pub expires_at: Option<i64>,
    /// Row creation time, epoch seconds.
    pub created_at: i64,
    /// Last mutation time, epoch seconds.
    pub updated_at: i64,
}

/// Input for lease writes; timestamps and the id are filled by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLease {
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Canonical lowercase colon-separated MAC.
    pub mac_address: String,
    /// Dotted IPv4 address.
    pub ip_address: String,
    /// Gateway that owns this lease.
    pub gateway_node: String,
    /// Public or private scope.
    pub is_public: bool,
    /// Expiry as epoch seconds, when known.
    pub expires_at: Option<i64>,
}

/// Referenced columns of `vps_instances`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InstanceRecord {
    /// VPS id.
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// MAC of the instance's NIC, when recorded.
    pub mac_address: Option<String>,
    /// Gateway node the instance runs behind.
    pub node_id: Option<String>,
    /// Lifecycle status.
    pub status: String,
}

/// Referenced columns of `vps_public_ips`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PublicIpRecord {
    /// The assigned public address.
    pub ip_address: String,
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
}

/// The relational lease authority.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    pool: SqlitePool,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl LeaseStore {
    /// Open (and create, if needed) the store at `url`.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // a single connection keeps in-memory databases alive and serialises
        // writers; lease traffic is low-volume control-plane work
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        for ddl in [
            r#"CREATE TABLE IF NOT EXISTS dhcp_leases (
                lease_id TEXT PRIMARY KEY,
                vps_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                mac_address TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                gateway_node TEXT NOT NULL,
                is_public INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (vps_id, is_public),
                UNIQUE (gateway_node, mac_address),
                UNIQUE (gateway_node, ip_address)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS vps_instances (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                mac_address TEXT,
                node_id TEXT,
                instance_id INTEGER,
                status TEXT NOT NULL DEFAULT 'running',
                deleted_at INTEGER
            )"#,
            r#"CREATE TABLE IF NOT EXISTS vps_public_ips (
                ip_address TEXT PRIMARY KEY,
                vps_id TEXT NOT NULL,
                organization_id TEXT NOT NULL
            )"#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Create or replace the lease for `(vps_id, is_public)`.
    pub async fn upsert_lease(&self, lease: &NewLease) -> Result<LeaseRecord, StoreError> {
        let now = now_epoch();
        let lease_id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"INSERT INTO dhcp_leases
                (lease_id, vps_id, organization_id, mac_address, ip_address,
                 gateway_node, is_public, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT (vps_id, is_public) DO UPDATE SET
                organization_id = excluded.organization_id,
                mac_address = excluded.mac_address,
                ip_address = excluded.ip_address,
                gateway_node = excluded.gateway_node,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at"#,
        )
        .bind(&lease_id)
        .bind(&lease.vps_id)
        .bind(&lease.organization_id)
        .bind(&lease.mac_address)
        .bind(&lease.ip_address)
        .bind(&lease.gateway_node)
        .bind(lease.is_public)
        .bind(lease.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
                return Err(StoreError::Conflict(format!(
                    "lease for vps {} conflicts with an existing binding on {}",
                    lease.vps_id, lease.gateway_node
                )));
            }
            Err(err) => return Err(err.into()),
        }

        self.find_lease_by_vps(&lease.vps_id, lease.is_public)
            .await?
            .ok_or_else(|| StoreError::Conflict("lease vanished after upsert".into()))
    }

    /// Insert the lease unless `(vps_id, is_public)` already has one.
    /// Returns the row and whether it was created by this call.
    pub async fn first_or_create(
        &self,
        lease: &NewLease,
    ) -> Result<(LeaseRecord, bool), StoreError> {
        if let Some(existing) = self
            .find_lease_by_vps(&lease.vps_id, lease.is_public)
            .await?
        {
            return Ok((existing, false));
        }
        let now = now_epoch();
        let lease_id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO dhcp_leases
                (lease_id, vps_id, organization_id, mac_address, ip_address,
                 gateway_node, is_public, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
        )
        .bind(&lease_id)
        .bind(&lease.vps_id)
        .bind(&lease.organization_id)
        .bind(&lease.mac_address)
        .bind(&lease.ip_address)
        .bind(&lease.gateway_node)
        .bind(lease.is_public)
        .bind(lease.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        match self
            .find_lease_by_vps(&lease.vps_id, lease.is_public)
            .await?
        {
            Some(record) => Ok((record, created)),
            // INSERT OR IGNORE was suppressed by a mac/ip collision with a
            // different vps; nothing sane to return
            None => Err(StoreError::Conflict(format!(
                "discovered lease {}/{} collides with an existing binding on {}",
                lease.mac_address, lease.ip_address, lease.gateway_node
            ))),
        }
    }

    /// Drop a VPS's leases on a gateway; returns how many rows went away.
    pub async fn delete_lease(
        &self,
        vps_id: &str,
        gateway_node: &str,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM dhcp_leases WHERE vps_id = ?1 AND gateway_node = ?2")
                .bind(vps_id)
                .bind(gateway_node)
                .execute(&self.pool)
                .await?;
        debug!(vps_id, gateway_node, deleted = result.rows_affected(), "lease delete");
        Ok(result.rows_affected())
    }

    /// Every lease owned by a gateway, the reconciler's desired set.
    pub async fn leases_for_gateway(
        &self,
        gateway_node: &str,
    ) -> Result<Vec<LeaseRecord>, StoreError> {
        Ok(sqlx::query_as::<_, LeaseRecord>(
            "SELECT * FROM dhcp_leases WHERE gateway_node = ?1 ORDER BY ip_address",
        )
        .bind(gateway_node)
        .fetch_all(&self.pool)
        .await?)
    }

    /// All leases, optionally filtered by organization and/or VPS.
    pub async fn list_leases(
        &self,
        organization_id: Option<&str>,
        vps_id: Option<&str>,
    ) -> Result<Vec<LeaseRecord>, StoreError> {
        Ok(sqlx::query_as::<_, LeaseRecord>(
            r#"SELECT * FROM dhcp_leases
            WHERE (?1 IS NULL OR organization_id = ?1)
              AND (?2 IS NULL OR vps_id = ?2)
            ORDER BY gateway_node, ip_address"#,
        )
        .bind(organization_id)
        .bind(vps_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The lease for a `(vps, scope)` pair, if one exists.
    pub async fn find_lease_by_vps(
        &self,
        vps_id: &str,
        is_public: bool,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(sqlx::query_as::<_, LeaseRecord>(
            "SELECT * FROM dhcp_leases WHERE vps_id = ?1 AND is_public = ?2",
        )
        .bind(vps_id)
        .bind(is_public)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The most recently touched lease for a MAC, across gateways.
    pub async fn find_lease_by_mac(
        &self,
        mac_address: &str,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(sqlx::query_as::<_, LeaseRecord>(
            "SELECT * FROM dhcp_leases WHERE mac_address = ?1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(mac_address)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The most recently touched lease for an address, across gateways.
    pub async fn find_lease_by_ip(
        &self,
        ip_address: &str,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(sqlx::query_as::<_, LeaseRecord>(
            "SELECT * FROM dhcp_leases WHERE ip_address = ?1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(ip_address)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// A live (not deleted) VPS instance owning the given MAC.
    pub async fn find_instance_by_mac(
        &self,
        mac_address: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(sqlx::query_as::<_, InstanceRecord>(
            r#"SELECT id, organization_id, mac_address, node_id, status
            FROM vps_instances
            WHERE mac_address = ?1 AND deleted_at IS NULL AND status != 'deleted'"#,
        )
        .bind(mac_address)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The public-IP assignment for an address, if any.
    pub async fn find_public_ip(
        &self,
        ip_address: &str,
    ) -> Result<Option<PublicIpRecord>, StoreError> {
        Ok(sqlx::query_as::<_, PublicIpRecord>(
            "SELECT ip_address, vps_id, organization_id FROM vps_public_ips WHERE ip_address = ?1",
        )
        .bind(ip_address)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Seed helper for `vps_instances`; the table is owned by the
    /// surrounding system in production.
    pub async fn insert_instance(
        &self,
        id: &str,
        organization_id: &str,
        mac_address: Option<&str>,
        node_id: Option<&str>,
        status: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO vps_instances (id, organization_id, mac_address, node_id, status)
            VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(id)
        .bind(organization_id)
        .bind(mac_address)
        .bind(node_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seed helper for `vps_public_ips`.
    pub async fn insert_public_ip(
        &self,
        ip_address: &str,
        vps_id: &str,
        organization_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vps_public_ips (ip_address, vps_id, organization_id) VALUES (?1, ?2, ?3)",
        )
        .bind(ip_address)
        .bind(vps_id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
