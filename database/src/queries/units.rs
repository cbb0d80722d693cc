//! Resource registry queries
//!
//! Functions taking a `SqliteConnection` are meant to run inside a caller's
//! transaction; an error leaves it to the caller to roll back.

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Pool, Sqlite, SqliteConnection, SqliteExecutor};
use standctl_core::{Error, GroupHeadroom, Result, UnitKind};
use tracing::{info, instrument};

use crate::models::{
    CapacityGroup, DeviceSpec, GroupSpec, Inventory, PinSpec, Unit, UnitFilter, UnitSpec,
};

const UNIT_COLUMNS: &str = r#"
    id, kind, unit_type, capacity_group, status, reservation_id,
    host, ssh_port, serial_port, image, pin_number, created_at, updated_at
"#;

// ============================================================================
// Lookups
// ============================================================================

/// List all units matching `filter`, ordered by id
#[instrument(skip(pool))]
pub async fn list_units(pool: &Pool<Sqlite>, filter: &UnitFilter) -> Result<Vec<Unit>> {
    let units = sqlx::query_as::<_, Unit>(&format!(
        "SELECT {} FROM units ORDER BY id",
        UNIT_COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list units")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(units.into_iter().filter(|u| filter.matches(u)).collect())
}

/// List AVAILABLE units, optionally of one kind
#[instrument(skip(executor))]
pub async fn list_available<'e, E: SqliteExecutor<'e>>(
    executor: E,
    kind: Option<UnitKind>,
    filter: &UnitFilter,
) -> Result<Vec<Unit>> {
    let units = sqlx::query_as::<_, Unit>(&format!(
        "SELECT {} FROM units WHERE status = 'available' ORDER BY id",
        UNIT_COLUMNS
    ))
    .fetch_all(executor)
    .await
    .context("Failed to list available units")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(units
        .into_iter()
        .filter(|u| kind.map_or(true, |k| u.kind() == Some(k)))
        .filter(|u| filter.matches(u))
        .collect())
}

/// Get unit by ID
#[instrument(skip(executor))]
pub async fn get_unit<'e, E: SqliteExecutor<'e>>(executor: E, id: &str) -> Result<Unit> {
    sqlx::query_as::<_, Unit>(&format!("SELECT {} FROM units WHERE id = ?", UNIT_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("Failed to get unit")
        .map_err(|e| Error::DatabaseError(e.to_string()))?
        .ok_or_else(|| Error::ResourceNotFound(format!("unit '{}'", id)))
}

/// Ids of the units currently leased to a reservation
#[instrument(skip(executor))]
pub async fn leased_unit_ids<'e, E: SqliteExecutor<'e>>(
    executor: E,
    reservation_id: &str,
) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM units
        WHERE reservation_id = ? AND status = 'leased'
        ORDER BY id
        "#,
    )
    .bind(reservation_id)
    .fetch_all(executor)
    .await
    .context("Failed to list leased units")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}

// ============================================================================
// Lease state
// ============================================================================

/// Lease every unit in `ids` to `reservation_id`.
///
/// Each unit is compare-and-set from AVAILABLE; if any of them was taken in
/// the meantime this fails with `AllocationConflict` and the caller must roll
/// back its transaction.
#[instrument(skip(conn))]
pub async fn mark_leased(
    conn: &mut SqliteConnection,
    ids: &[String],
    reservation_id: &str,
) -> Result<()> {
    let now = Utc::now();

    for id in ids {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'leased', reservation_id = ?, updated_at = ?
            WHERE id = ? AND status = 'available'
            "#,
        )
        .bind(reservation_id)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to lease unit")
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

        if result.rows_affected() != 1 {
            return Err(Error::AllocationConflict(format!(
                "unit '{}' is no longer available",
                id
            )));
        }
    }

    Ok(())
}

/// Return units to AVAILABLE. Returns how many were actually leased before.
#[instrument(skip(conn))]
pub async fn mark_released(conn: &mut SqliteConnection, ids: &[String]) -> Result<u64> {
    let now = Utc::now();
    let mut released = 0;

    for id in ids {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'available', reservation_id = NULL, updated_at = ?
            WHERE id = ? AND status = 'leased'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to release unit")
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

        released += result.rows_affected();
    }

    Ok(released)
}

// ============================================================================
// Capacity groups
// ============================================================================

const GROUP_USAGE_QUERY: &str = r#"
    SELECT g.id, g.capacity,
           (SELECT COUNT(*) FROM units u WHERE u.capacity_group = g.id) AS members,
           (SELECT COUNT(*) FROM units u
            WHERE u.capacity_group = g.id AND u.status = 'leased') AS leased
    FROM capacity_groups g
    ORDER BY g.id
"#;

/// List capacity groups with member and lease counts
#[instrument(skip(executor))]
pub async fn list_groups<'e, E: SqliteExecutor<'e>>(executor: E) -> Result<Vec<CapacityGroup>> {
    sqlx::query_as::<_, CapacityGroup>(GROUP_USAGE_QUERY)
        .fetch_all(executor)
        .await
        .context("Failed to list capacity groups")
        .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Remaining lease slots of every group (capacity minus leased members)
pub async fn group_headroom<'e, E: SqliteExecutor<'e>>(executor: E) -> Result<GroupHeadroom> {
    Ok(list_groups(executor)
        .await?
        .into_iter()
        .map(|g| {
            let headroom = g.headroom();
            (g.id, headroom)
        })
        .collect())
}

/// Groups whose leased member count exceeds their capacity
pub async fn groups_over_capacity<'e, E: SqliteExecutor<'e>>(executor: E) -> Result<Vec<String>> {
    Ok(list_groups(executor)
        .await?
        .into_iter()
        .filter(|g| g.leased > g.capacity)
        .map(|g| g.id)
        .collect())
}

/// Whether `additional` more pins can be registered into `group`
#[instrument(skip(executor))]
pub async fn group_capacity_check<'e, E: SqliteExecutor<'e>>(
    executor: E,
    group: &str,
    additional: u32,
) -> Result<bool> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT g.capacity,
               (SELECT COUNT(*) FROM units u WHERE u.capacity_group = g.id)
        FROM capacity_groups g
        WHERE g.id = ?
        "#,
    )
    .bind(group)
    .fetch_optional(executor)
    .await
    .context("Failed to check group capacity")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let (capacity, members) =
        row.ok_or_else(|| Error::ResourceNotFound(format!("capacity group '{}'", group)))?;

    Ok(members + i64::from(additional) <= capacity)
}

// ============================================================================
// Registration
// ============================================================================

/// Create or update a capacity group
#[instrument(skip(conn))]
pub async fn upsert_group(conn: &mut SqliteConnection, group: &GroupSpec) -> Result<()> {
    let members: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE capacity_group = ?")
            .bind(&group.id)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to count group members")
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

    if members > i64::from(group.capacity) {
        return Err(Error::CapacityExceeded(format!(
            "group '{}' already has {} members, more than capacity {}",
            group.id, members, group.capacity
        )));
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO capacity_groups (id, capacity, created_at, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            capacity = excluded.capacity,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&group.id)
    .bind(i64::from(group.capacity))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert capacity group")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

async fn register_device(conn: &mut SqliteConnection, device: &DeviceSpec) -> Result<()> {
    if device.host.is_none() && device.serial_port.is_none() {
        return Err(Error::ConfigError(format!(
            "device '{}' has neither a shell host nor a serial port",
            device.id
        )));
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO units (id, kind, unit_type, capacity_group, status,
                           host, ssh_port, serial_port, image, created_at, updated_at)
        VALUES (?, 'device', ?, NULL, 'available', ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            kind = 'device',
            unit_type = excluded.unit_type,
            capacity_group = NULL,
            host = excluded.host,
            ssh_port = excluded.ssh_port,
            serial_port = excluded.serial_port,
            image = excluded.image,
            pin_number = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&device.id)
    .bind(&device.unit_type)
    .bind(&device.host)
    .bind(device.ssh_port.map(i64::from))
    .bind(&device.serial_port)
    .bind(&device.image)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to register device")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

async fn register_pin(conn: &mut SqliteConnection, pin: &PinSpec) -> Result<()> {
    let current_group: Option<Option<String>> =
        sqlx::query_scalar("SELECT capacity_group FROM units WHERE id = ?")
            .bind(&pin.id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to look up pin")
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let joining = current_group.flatten().as_deref() != Some(pin.group.as_str());
    if joining && !group_capacity_check(&mut *conn, &pin.group, 1).await? {
        return Err(Error::CapacityExceeded(format!(
            "cannot add pin '{}': group '{}' is full",
            pin.id, pin.group
        )));
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO units (id, kind, unit_type, capacity_group, status,
                           pin_number, created_at, updated_at)
        VALUES (?, 'pin', ?, ?, 'available', ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            kind = 'pin',
            unit_type = excluded.unit_type,
            capacity_group = excluded.capacity_group,
            host = NULL,
            ssh_port = NULL,
            serial_port = NULL,
            image = NULL,
            pin_number = excluded.pin_number,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&pin.id)
    .bind(&pin.unit_type)
    .bind(&pin.group)
    .bind(pin.number.map(i64::from))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to register pin")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

/// Create or update one unit. Existing lease state is preserved.
#[instrument(skip(conn))]
pub async fn register_unit(conn: &mut SqliteConnection, unit: &UnitSpec) -> Result<()> {
    match unit {
        UnitSpec::Device(device) => register_device(conn, device).await,
        UnitSpec::Pin(pin) => register_pin(conn, pin).await,
    }
}

/// Counts of what an inventory load touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventorySummary {
    pub groups: usize,
    pub devices: usize,
    pub pins: usize,
}

/// Register a whole inventory in one transaction.
///
/// Idempotent: loading the same inventory twice changes nothing, and units
/// keep their lease status across reloads.
#[instrument(skip(pool, inventory))]
pub async fn load_inventory(pool: &Pool<Sqlite>, inventory: &Inventory) -> Result<InventorySummary> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin transaction")
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    for group in &inventory.groups {
        upsert_group(&mut *tx, group).await?;
    }
    for device in &inventory.devices {
        register_unit(&mut *tx, &UnitSpec::Device(device.clone())).await?;
    }
    for pin in &inventory.pins {
        register_unit(&mut *tx, &UnitSpec::Pin(pin.clone())).await?;
    }

    tx.commit()
        .await
        .context("Failed to commit transaction")
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let summary = InventorySummary {
        groups: inventory.groups.len(),
        devices: inventory.devices.len(),
        pins: inventory.pins.len(),
    };
    info!(?summary, "Inventory loaded");

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn stand() -> Inventory {
        Inventory {
            groups: vec![GroupSpec {
                id: "relay-1".into(),
                capacity: 2,
            }],
            devices: vec![
                DeviceSpec {
                    id: "dut-01".into(),
                    unit_type: "tedix-v1-02".into(),
                    host: Some("10.0.0.11".into()),
                    ssh_port: None,
                    serial_port: Some("/dev/ttyUSB0".into()),
                    image: Some("dev".into()),
                },
                DeviceSpec {
                    id: "dut-02".into(),
                    unit_type: "tedix-v1-02".into(),
                    host: Some("10.0.0.12".into()),
                    ssh_port: Some(2222),
                    serial_port: None,
                    image: Some("release".into()),
                },
            ],
            pins: vec![
                PinSpec {
                    id: "pin-power-1".into(),
                    unit_type: "power".into(),
                    group: "relay-1".into(),
                    number: Some(1),
                },
                PinSpec {
                    id: "pin-boot-1".into(),
                    unit_type: "boot".into(),
                    group: "relay-1".into(),
                    number: Some(2),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_load_inventory_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();

        let summary = load_inventory(pool, &stand()).await.unwrap();
        assert_eq!(summary.devices, 2);
        assert_eq!(summary.pins, 2);

        load_inventory(pool, &stand()).await.unwrap();

        let units = list_units(pool, &UnitFilter::default()).await.unwrap();
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| !u.is_leased()));

        let groups = list_groups(pool).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, 2);
    }

    #[tokio::test]
    async fn test_pin_registration_respects_group_capacity() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();
        load_inventory(pool, &stand()).await.unwrap();

        assert!(!group_capacity_check(pool, "relay-1", 1).await.unwrap());
        assert!(group_capacity_check(pool, "relay-1", 0).await.unwrap());

        let mut inventory = stand();
        inventory.pins.push(PinSpec {
            id: "pin-reset-1".into(),
            unit_type: "reset".into(),
            group: "relay-1".into(),
            number: Some(3),
        });
        let err = load_inventory(pool, &inventory).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));

        // Nothing from the failed load was kept
        assert!(get_unit(pool, "pin-reset-1").await.is_err());

        let err = group_capacity_check(pool, "relay-9", 1).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_leased_is_compare_and_set() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();
        load_inventory(pool, &stand()).await.unwrap();

        // Reservation rows are referenced by units
        sqlx::query(
            "INSERT INTO reservations (id, requester, requested_counts, status, created_at)
             VALUES ('r1', 'test', '{}', 'active', ?), ('r2', 'test', '{}', 'active', ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();

        let ids = vec!["dut-01".to_string()];
        let mut conn = pool.acquire().await.unwrap();
        mark_leased(&mut conn, &ids, "r1").await.unwrap();

        let err = mark_leased(&mut conn, &ids, "r2").await.unwrap_err();
        assert!(matches!(err, Error::AllocationConflict(_)));
        drop(conn);

        let unit = get_unit(pool, "dut-01").await.unwrap();
        assert!(unit.is_leased());
        assert_eq!(unit.reservation_id.as_deref(), Some("r1"));
        assert_eq!(leased_unit_ids(pool, "r1").await.unwrap(), ids);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(mark_released(&mut conn, &ids).await.unwrap(), 1);
        assert_eq!(mark_released(&mut conn, &ids).await.unwrap(), 0);
        drop(conn);

        let unit = get_unit(pool, "dut-01").await.unwrap();
        assert!(!unit.is_leased());
        assert!(unit.reservation_id.is_none());
    }

    #[tokio::test]
    async fn test_listing_filters() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();
        load_inventory(pool, &stand()).await.unwrap();

        let pins = list_available(pool, Some(UnitKind::Pin), &UnitFilter::default())
            .await
            .unwrap();
        assert_eq!(pins.len(), 2);

        let filter = UnitFilter {
            unit_type: Some("tedix-v1-02".into()),
            ..Default::default()
        };
        let devices = list_units(pool, &filter).await.unwrap();
        assert_eq!(
            devices.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
            vec!["dut-01", "dut-02"]
        );
        assert_eq!(devices[0].shell_port(), Some(22));
        assert_eq!(devices[1].shell_port(), Some(2222));

        let headroom = group_headroom(pool).await.unwrap();
        assert_eq!(headroom.get("relay-1"), Some(&2));

        let err = get_unit(pool, "nope").await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }
}
