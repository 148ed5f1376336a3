//! Prepared-statement name table (spec §4.3). The SQL text for each
//! name is entirely configuration-driven; this module only owns the
//! enumeration and the lookup from `Config::sql`.

use std::collections::HashMap;

use strum_macros::{EnumIter, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum QueryName {
    #[strum(serialize = "sql-check-available")]
    CheckAvailable,
    #[strum(serialize = "sql-connection-close")]
    ConnectionClose,
    #[strum(serialize = "sql-connection-established")]
    ConnectionEstablished,
    #[strum(serialize = "sql-connection-begin")]
    ConnectionBegin,
    #[strum(serialize = "sql-connection-not-allowed")]
    ConnectionNotAllowed,
    #[strum(serialize = "sql-check-vip")]
    CheckVip,
    #[strum(serialize = "sql-blacklist")]
    Blacklist,
    #[strum(serialize = "sql-add-to-blacklist")]
    AddToBlacklist,
    #[strum(serialize = "sql-add-details")]
    AddDetails,
    #[strum(serialize = "sql-add-machine-owner")]
    AddMachineOwner,
    #[strum(serialize = "sql-update-machine-access")]
    UpdateMachineAccess,
    #[strum(serialize = "sql-call-failure-guessing")]
    CallFailureGuessing,
    #[strum(serialize = "sql-all-product-names")]
    AllProductNames,
}

/// Resolves each `QueryName` to its configured SQL text. Lazily
/// re-resolved after a reconnect, matching "statement creation is lazy
/// on first use" in spec §4.3.
pub struct QueryTable {
    text: HashMap<QueryName, String>,
}

impl QueryTable {
    pub fn from_config(sql: &HashMap<String, String>) -> Self {
        use strum::IntoEnumIterator;
        let mut text = HashMap::new();
        for name in QueryName::iter() {
            let key: &'static str = name.into();
            if let Some(v) = sql.get(key) {
                text.insert(name, v.clone());
            }
        }
        QueryTable { text }
    }

    pub fn get(&self, name: QueryName) -> Option<&str> {
        self.text.get(&name).map(String::as_str)
    }
}
