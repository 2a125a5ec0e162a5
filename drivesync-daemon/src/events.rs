//! Translation of `notify` events into [`LocalEvent`]s.
//!
//! On Linux a rename inside the watched tree arrives as `Name(From)`,
//! `Name(To)` and then `Name(Both)`. Each is translated on its own; the
//! local watcher folds the three into one move.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};

use drivesync_sync::LocalEvent;

pub fn translate(event: &Event) -> Vec<LocalEvent> {
    let paths = event.paths.iter();
    match &event.kind {
        EventKind::Create(_) => paths.map(LocalEvent::created).collect(),
        EventKind::Remove(_) => paths.map(LocalEvent::removed).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => {
                vec![LocalEvent::renamed(&event.paths[0], &event.paths[1])]
            }
            RenameMode::From => paths.map(LocalEvent::removed).collect(),
            RenameMode::To => paths.map(LocalEvent::created).collect(),
            // FSEvents cannot tell which side of a rename a path was on.
            _ => paths
                .map(|path| {
                    if path.symlink_metadata().is_ok() {
                        LocalEvent::created(path)
                    } else {
                        LocalEvent::removed(path)
                    }
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths.map(LocalEvent::modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn create_modify_remove_map_directly() {
        assert_eq!(
            translate(&event(EventKind::Create(CreateKind::File), &["/r/a"])),
            vec![LocalEvent::created("/r/a")]
        );
        assert_eq!(
            translate(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/r/a"]
            )),
            vec![LocalEvent::modified("/r/a")]
        );
        assert_eq!(
            translate(&event(EventKind::Remove(RemoveKind::Folder), &["/r/d"])),
            vec![LocalEvent::removed("/r/d")]
        );
    }

    #[test]
    fn paired_rename_keeps_both_paths() {
        let translated = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old", "/r/new"],
        ));
        assert_eq!(translated, vec![LocalEvent::renamed("/r/old", "/r/new")]);
    }

    #[test]
    fn rename_halves_become_remove_and_create() {
        assert_eq!(
            translate(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/r/old"]
            )),
            vec![LocalEvent::removed("/r/old")]
        );
        assert_eq!(
            translate(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/r/new"]
            )),
            vec![LocalEvent::created("/r/new")]
        );
    }

    #[test]
    fn noise_is_dropped() {
        for kind in [
            EventKind::Access(AccessKind::Any),
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            EventKind::Other,
        ] {
            assert!(translate(&event(kind, &["/r/a"])).is_empty());
        }
    }
}
