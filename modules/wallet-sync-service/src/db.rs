//! SQLite snapshot of the tracked set and last merged wallet records.

use crate::poller::parse_address;
use ethers::types::Address;
use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};
use wallet_sync_types::WalletRecord;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tracked_wallets (
                address TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                added_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_records (
                address TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Tracked set
    // =====================================================

    /// Replace the tracked set, dropping records of wallets no longer tracked
    pub fn save_tracked(&self, addresses: &[Address]) -> SqliteResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tracked_wallets", [])?;
        for (position, address) in addresses.iter().enumerate() {
            tx.execute(
                "INSERT INTO tracked_wallets (address, position) VALUES (?1, ?2)",
                rusqlite::params![to_key(address), position as i64],
            )?;
        }
        tx.execute(
            "DELETE FROM wallet_records WHERE address NOT IN (SELECT address FROM tracked_wallets)",
            [],
        )?;
        tx.commit()
    }

    pub fn load_tracked(&self) -> SqliteResult<Vec<Address>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM tracked_wallets ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut addresses = Vec::new();
        for raw in rows {
            let raw = raw?;
            match parse_address(&raw) {
                Ok(address) => addresses.push(address),
                Err(e) => log::warn!("[WALLET_SYNC] Skipping stored address: {}", e),
            }
        }
        Ok(addresses)
    }

    // =====================================================
    // Wallet records
    // =====================================================

    pub fn save_records(&self, records: &[WalletRecord]) -> SqliteResult<()> {
        let mut conn = self.conn.lock();
        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        for record in records {
            let json = serde_json::to_string(record)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.execute(
                "INSERT INTO wallet_records (address, record_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET record_json = excluded.record_json, updated_at = excluded.updated_at",
                rusqlite::params![to_key(&record.address), json, now],
            )?;
        }
        tx.commit()
    }

    pub fn load_records(&self) -> SqliteResult<Vec<WalletRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address, record_json FROM wallet_records")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (address, json) = row?;
            match serde_json::from_str::<WalletRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("[WALLET_SYNC] Skipping stored record {}: {}", address, e),
            }
        }
        Ok(records)
    }
}

/// Lowercase `0x` hex, the same form `parse_address` accepts
fn to_key(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_tracked_set_keeps_order() {
        let db = Db::open(":memory:").unwrap();
        assert!(db.load_tracked().unwrap().is_empty());

        db.save_tracked(&[addr(3), addr(1), addr(2)]).unwrap();
        assert_eq!(db.load_tracked().unwrap(), vec![addr(3), addr(1), addr(2)]);

        db.save_tracked(&[addr(2)]).unwrap();
        assert_eq!(db.load_tracked().unwrap(), vec![addr(2)]);
    }

    #[test]
    fn test_records_upsert_and_prune() {
        let db = Db::open(":memory:").unwrap();
        db.save_tracked(&[addr(1), addr(2)]).unwrap();

        let mut first = WalletRecord::new(addr(1));
        first.require = Some(U256::from(1));
        let second = WalletRecord {
            owners: Some(vec![addr(9)]),
            ..WalletRecord::new(addr(2))
        };
        db.save_records(&[first.clone(), second.clone()]).unwrap();

        first.require = Some(U256::from(2));
        db.save_records(&[first.clone()]).unwrap();

        let mut loaded = db.load_records().unwrap();
        loaded.sort_by_key(|r| r.address);
        assert_eq!(loaded, vec![first, second.clone()]);

        db.save_tracked(&[addr(2)]).unwrap();
        assert_eq!(db.load_records().unwrap(), vec![second]);
    }

    #[test]
    fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet_sync.db");
        let path = path.to_str().unwrap();

        {
            let db = Db::open(path).unwrap();
            db.save_tracked(&[addr(7)]).unwrap();
        }
        let db = Db::open(path).unwrap();
        assert_eq!(db.load_tracked().unwrap(), vec![addr(7)]);
    }
}
