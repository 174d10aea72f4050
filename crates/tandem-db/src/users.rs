use std::collections::BTreeSet;

use anyhow::Result;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use tandem_types::models::{AgeGroup, Gender, UserProfile};

use crate::Database;
use crate::models::parse_id;

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &UserProfile) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, gender, age_group) VALUES (?1, ?2, ?3, ?4)",
                (
                    user.id.to_string(),
                    &user.display_name,
                    user.gender.as_str(),
                    user.age_group.as_str(),
                ),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, display_name, gender, age_group FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        let Some((id, display_name, gender, age_group)) = row else {
            return Ok(None);
        };

        Ok(Some(UserProfile {
            id: parse_id(&id)?,
            display_name,
            gender: gender.parse::<Gender>()?,
            age_group: age_group.parse::<AgeGroup>()?,
        }))
    }

    pub fn get_display_name(&self, id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let name = conn
                .query_row(
                    "SELECT display_name FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(name)
        })
    }

    // -- Blocks --

    pub fn block_user(&self, user_id: Uuid, blocked_user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO user_blocks (user_id, blocked_user_id) VALUES (?1, ?2)",
                (user_id.to_string(), blocked_user_id.to_string()),
            )?;
            Ok(())
        })
    }

    pub fn get_blocked_ids(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>> {
        let raw: Vec<String> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT blocked_user_id FROM user_blocks WHERE user_id = ?1")?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;

        raw.iter().map(|id| parse_id(id)).collect()
    }

    /// Whether `user_id` and any of `others` block each other, in either direction.
    pub fn any_block_between(&self, user_id: Uuid, others: &[Uuid]) -> Result<bool> {
        if others.is_empty() {
            return Ok(false);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (2..=others.len() + 1).map(|i| format!("?{}", i)).collect();
            let list = placeholders.join(", ");
            let sql = format!(
                "SELECT EXISTS (
                    SELECT 1 FROM user_blocks
                    WHERE (user_id = ?1 AND blocked_user_id IN ({list}))
                       OR (blocked_user_id = ?1 AND user_id IN ({list}))
                )"
            );

            let mut params: Vec<String> = Vec::with_capacity(others.len() + 1);
            params.push(user_id.to_string());
            params.extend(others.iter().map(|id| id.to_string()));

            let blocked: bool =
                conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
            Ok(blocked)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, gender: Gender) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
            gender,
            age_group: AgeGroup::Adult,
        }
    }

    #[test]
    fn profile_and_name_lookup() {
        let db = Database::open_in_memory().unwrap();
        let alice = user("alice", Gender::Female);
        db.create_user(&alice).unwrap();

        assert_eq!(db.get_user(alice.id).unwrap(), Some(alice.clone()));
        assert_eq!(db.get_display_name(alice.id).unwrap().as_deref(), Some("alice"));
        assert_eq!(db.get_display_name(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn blocks_are_checked_both_ways() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        db.block_user(b, a).unwrap();
        db.block_user(b, a).unwrap();

        assert_eq!(db.get_blocked_ids(b).unwrap().len(), 1);
        assert!(db.any_block_between(a, &[c, b]).unwrap());
        assert!(db.any_block_between(b, &[a]).unwrap());
        assert!(!db.any_block_between(a, &[c]).unwrap());
        assert!(!db.any_block_between(a, &[]).unwrap());
    }
}
