//! Providers, their slots and the tokens in them.

mod events;
mod id;
pub(crate) mod manager;
pub mod provider;
mod watcher;

use serde::Serialize;

pub use self::id::TokenId;
pub use self::provider::{PrivateMode, ProviderId, ProviderSettings, SlotEventMethod};

use crate::module::SlotId;

//------------ TokenSummary --------------------------------------------------

/// A token currently present, as listed by
/// [`Pkcs11Helper::tokens`](crate::Pkcs11Helper::tokens).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TokenSummary {
    pub id: TokenId,

    /// The friendly name of the provider.
    pub provider: String,
    pub slot: SlotId,

    /// The description of the slot the token is in.
    pub reader: String,
    pub login_required: bool,
    pub protected_auth_path: bool,
    pub user_pin_locked: bool,
}

impl TokenSummary {
    pub(crate) fn from_present(present: manager::PresentToken) -> Self {
        let info = &present.token.info;
        TokenSummary {
            provider: present.provider.name.clone(),
            slot: present.slot,
            reader: present.token.reader.clone(),
            login_required: info.login_required,
            protected_auth_path: info.protected_auth_path || present.provider.settings.protected_auth,
            user_pin_locked: info.user_pin_locked,
            id: present.token.id,
        }
    }
}
