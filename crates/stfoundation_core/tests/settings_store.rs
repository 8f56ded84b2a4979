use serde::{Deserialize, Serialize};
use stfoundation_core::{SettingsError, SettingsStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReminderPreferences {
    enabled: bool,
    hour: u8,
    weekdays: Vec<u8>,
}

#[test]
fn missing_keys_fall_back_to_the_default() {
    let settings = SettingsStore::open_in_memory().unwrap();
    assert!(!settings.get_setting("onboarding.completed", false));
    assert_eq!(settings.get_setting("sync.interval", 30_u32), 30);
    assert_eq!(settings.try_get_setting::<String>("theme").unwrap(), None);
}

#[test]
fn undecodable_values_fall_back_to_the_default() {
    let settings = SettingsStore::open_in_memory().unwrap();
    settings.set_setting("sync.interval", "soon").unwrap();

    assert_eq!(settings.get_setting("sync.interval", 30_u32), 30);
    assert!(matches!(
        settings.try_get_setting::<u32>("sync.interval"),
        Err(SettingsError::Serialization(_))
    ));
}

#[test]
fn structured_values_round_trip_and_can_be_removed() {
    let settings = SettingsStore::open_in_memory().unwrap();
    let preferences = ReminderPreferences {
        enabled: true,
        hour: 8,
        weekdays: vec![1, 3, 5],
    };
    settings.set_setting("reminders", &preferences).unwrap();
    settings.set_setting("theme", "dark").unwrap();

    let loaded: Option<ReminderPreferences> = settings.try_get_setting("reminders").unwrap();
    assert_eq!(loaded, Some(preferences));
    assert_eq!(settings.keys().unwrap(), vec!["reminders", "theme"]);

    assert!(settings.remove_setting("reminders").unwrap());
    assert!(!settings.remove_setting("reminders").unwrap());
    assert_eq!(settings.keys().unwrap(), vec!["theme"]);
}

#[test]
fn overwriting_a_key_keeps_the_latest_value() {
    let settings = SettingsStore::open_in_memory().unwrap();
    settings.set_setting("theme", "dark").unwrap();
    settings.set_setting("theme", "light").unwrap();
    assert_eq!(settings.get_setting("theme", String::new()), "light");
}

#[test]
fn blank_keys_are_rejected() {
    let settings = SettingsStore::open_in_memory().unwrap();
    assert!(matches!(
        settings.set_setting("  ", &1),
        Err(SettingsError::InvalidKey(_))
    ));
}

#[test]
fn values_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group").join("com.example.app.settings.sqlite");

    {
        let settings = SettingsStore::open(&path).unwrap();
        settings.set_setting("onboarding.completed", &true).unwrap();
    }

    let settings = SettingsStore::open(&path).unwrap();
    assert!(settings.get_setting("onboarding.completed", false));
}
