//! Which channels are plotted, in what order, unit and style.
//!
//! Rendering surfaces subscribe to [`SelectionEvent`]s instead of polling;
//! every successful mutation bumps [`Selection::revision`] and notifies all
//! live subscribers.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dataset::{ChannelRef, DatasetId};
use crate::error::{IncompatibleUnitError, SelectionError};
use crate::state::{CHART_COLORS, MAX_CHANNELS};
use crate::units::{UnitConverter, UnitRegistry, UnitTag};

/// How a selected channel is drawn
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStyle {
    /// Index into the color palette
    pub color_index: usize,
    pub visible: bool,
    pub line_width: f32,
}

impl Default for TraceStyle {
    fn default() -> Self {
        Self {
            color_index: 0,
            visible: true,
            line_width: 1.5,
        }
    }
}

/// A channel selected for plotting
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedChannel {
    pub channel: ChannelRef,
    /// Unit the channel was logged in
    pub native_unit: UnitTag,
    /// Unit to display in; `None` displays the native unit
    pub display_unit: Option<UnitTag>,
    pub style: TraceStyle,
}

impl SelectedChannel {
    /// The unit values are displayed in
    pub fn effective_unit(&self) -> &UnitTag {
        self.display_unit.as_ref().unwrap_or(&self.native_unit)
    }
}

/// What changed in the selection
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionChange {
    Added(ChannelRef),
    Removed(ChannelRef),
    Reordered,
    DisplayUnit {
        channel: ChannelRef,
        unit: Option<UnitTag>,
    },
    Style(ChannelRef),
    /// All channels of a dataset were dropped (the dataset was closed)
    DatasetCleared { dataset: DatasetId, removed: usize },
}

/// Notification sent to subscribers after a mutation
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionEvent {
    /// Revision after the change
    pub revision: u64,
    pub change: SelectionChange,
}

/// The ordered list of plotted channels
#[derive(Debug)]
pub struct Selection {
    entries: Vec<SelectedChannel>,
    max_channels: usize,
    revision: u64,
    units: Arc<UnitRegistry>,
    subscribers: Vec<Sender<SelectionEvent>>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::new(MAX_CHANNELS)
    }
}

impl Selection {
    pub fn new(max_channels: usize) -> Self {
        Self::with_units(max_channels, Arc::new(UnitRegistry::standard().clone()))
    }

    /// Use a custom unit registry for display-unit checks
    pub fn with_units(max_channels: usize, units: Arc<UnitRegistry>) -> Self {
        Self {
            entries: Vec::new(),
            max_channels,
            revision: 0,
            units,
            subscribers: Vec::new(),
        }
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Incremented on every successful mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selected channels in display order
    pub fn iter(&self) -> impl Iterator<Item = &SelectedChannel> {
        self.entries.iter()
    }

    pub fn get(&self, channel: &ChannelRef) -> Option<&SelectedChannel> {
        self.entries.iter().find(|e| &e.channel == channel)
    }

    pub fn contains(&self, channel: &ChannelRef) -> bool {
        self.get(channel).is_some()
    }

    /// Receive an event for every future change
    pub fn subscribe(&mut self) -> Receiver<SelectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Add a channel at the end of the display order.
    ///
    /// The new entry gets the first palette color not used by another entry.
    pub fn add(&mut self, channel: ChannelRef, native_unit: UnitTag) -> Result<&SelectedChannel, SelectionError> {
        if self.contains(&channel) {
            return Err(SelectionError::AlreadySelected(channel.to_string()));
        }
        if self.entries.len() >= self.max_channels {
            return Err(SelectionError::LimitReached(self.max_channels));
        }

        let used_colors: HashSet<usize> = self.entries.iter().map(|e| e.style.color_index).collect();
        let color_index = (0..CHART_COLORS.len())
            .find(|i| !used_colors.contains(i))
            .unwrap_or(self.entries.len() % CHART_COLORS.len());

        self.entries.push(SelectedChannel {
            channel: channel.clone(),
            native_unit,
            display_unit: None,
            style: TraceStyle {
                color_index,
                ..TraceStyle::default()
            },
        });
        self.notify(SelectionChange::Added(channel));
        let index = self.entries.len() - 1;
        Ok(&self.entries[index])
    }

    pub fn remove(&mut self, channel: &ChannelRef) -> Result<SelectedChannel, SelectionError> {
        let index = self.position(channel)?;
        let removed = self.entries.remove(index);
        self.notify(SelectionChange::Removed(channel.clone()));
        Ok(removed)
    }

    /// Replace the display order; `new_order` must list every selected
    /// channel exactly once.
    pub fn reorder(&mut self, new_order: &[ChannelRef]) -> Result<(), SelectionError> {
        if new_order.len() != self.entries.len() {
            return Err(SelectionError::InvalidOrder);
        }
        let mut remaining: Vec<Option<SelectedChannel>> = self.entries.iter().cloned().map(Some).collect();
        let mut reordered = Vec::with_capacity(new_order.len());
        for channel in new_order {
            let slot = remaining
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|e| &e.channel == channel))
                .ok_or(SelectionError::InvalidOrder)?;
            reordered.extend(slot.take());
        }
        self.entries = reordered;
        self.notify(SelectionChange::Reordered);
        Ok(())
    }

    /// Change the display unit. An incompatible unit is rejected and the
    /// selection is left untouched.
    pub fn set_display_unit(&mut self, channel: &ChannelRef, unit: Option<UnitTag>) -> Result<(), SelectionError> {
        let index = self.position(channel)?;
        if let Some(target) = &unit {
            let native = &self.entries[index].native_unit;
            if !self.units.compatible(native, target) {
                return Err(IncompatibleUnitError {
                    from: native.clone(),
                    to: target.clone(),
                }
                .into());
            }
        }
        self.entries[index].display_unit = unit.clone();
        self.notify(SelectionChange::DisplayUnit {
            channel: channel.clone(),
            unit,
        });
        Ok(())
    }

    pub fn set_style(&mut self, channel: &ChannelRef, style: TraceStyle) -> Result<(), SelectionError> {
        let index = self.position(channel)?;
        self.entries[index].style = style;
        self.notify(SelectionChange::Style(channel.clone()));
        Ok(())
    }

    /// Drop every entry of `dataset`, returning how many were removed
    pub fn clear_dataset(&mut self, dataset: DatasetId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.channel.dataset != dataset);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.notify(SelectionChange::DatasetCleared { dataset, removed });
        }
        removed
    }

    /// Conversion from the native to the display unit of an entry
    pub fn converter(&self, entry: &SelectedChannel) -> Result<UnitConverter, IncompatibleUnitError> {
        match &entry.display_unit {
            Some(unit) => self.units.converter(&entry.native_unit, unit),
            None => Ok(UnitConverter::IDENTITY),
        }
    }

    fn position(&self, channel: &ChannelRef) -> Result<usize, SelectionError> {
        self.entries
            .iter()
            .position(|e| &e.channel == channel)
            .ok_or_else(|| SelectionError::NotSelected(channel.to_string()))
    }

    fn notify(&mut self, change: SelectionChange) {
        self.revision += 1;
        let event = SelectionEvent {
            revision: self.revision,
            change,
        };
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> ChannelRef {
        ChannelRef::new(DatasetId(1), name)
    }

    #[test]
    fn test_add_assigns_first_unused_color() {
        let mut selection = Selection::default();
        selection.add(channel("a"), "V".into()).unwrap();
        selection.add(channel("b"), "V".into()).unwrap();
        selection.add(channel("c"), "V".into()).unwrap();
        selection.remove(&channel("b")).unwrap();

        let d = selection.add(channel("d"), "V".into()).unwrap();
        assert_eq!(d.style.color_index, 1);
        let names: Vec<_> = selection.iter().map(|e| e.channel.channel.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_duplicates_and_limit() {
        let mut selection = Selection::new(2);
        selection.add(channel("a"), "V".into()).unwrap();
        assert!(matches!(
            selection.add(channel("a"), "V".into()),
            Err(SelectionError::AlreadySelected(_))
        ));
        selection.add(channel("b"), "V".into()).unwrap();
        assert_eq!(
            selection.add(channel("c"), "V".into()).unwrap_err(),
            SelectionError::LimitReached(2)
        );
        assert_eq!(selection.len(), 2);
    }

    #[test]
    fn test_incompatible_display_unit_leaves_state() {
        let mut selection = Selection::default();
        selection.add(channel("oil"), "°C".into()).unwrap();
        let revision = selection.revision();

        let err = selection
            .set_display_unit(&channel("oil"), Some("m".into()))
            .unwrap_err();
        assert_eq!(
            err,
            SelectionError::IncompatibleUnit(IncompatibleUnitError {
                from: "°C".into(),
                to: "m".into()
            })
        );
        assert_eq!(selection.get(&channel("oil")).unwrap().display_unit, None);
        assert_eq!(selection.revision(), revision);

        selection.set_display_unit(&channel("oil"), Some("°F".into())).unwrap();
        let entry = selection.get(&channel("oil")).unwrap();
        assert_eq!(entry.effective_unit().as_str(), "°F");
        let converter = selection.converter(entry).unwrap();
        assert!((converter.apply(100.0) - 212.0).abs() < 1e-9);
    }

    #[test]
    fn test_reorder_must_be_permutation() {
        let mut selection = Selection::default();
        for name in ["a", "b", "c"] {
            selection.add(channel(name), "".into()).unwrap();
        }

        assert_eq!(
            selection.reorder(&[channel("a"), channel("a"), channel("b")]),
            Err(SelectionError::InvalidOrder)
        );
        assert_eq!(selection.reorder(&[channel("a"), channel("b")]), Err(SelectionError::InvalidOrder));
        assert_eq!(
            selection.reorder(&[channel("a"), channel("b"), channel("x")]),
            Err(SelectionError::InvalidOrder)
        );

        selection.reorder(&[channel("c"), channel("a"), channel("b")]).unwrap();
        let names: Vec<_> = selection.iter().map(|e| e.channel.channel.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let mut selection = Selection::default();
        let rx = selection.subscribe();
        let dropped = selection.subscribe();
        drop(dropped);

        selection.add(channel("a"), "kPa".into()).unwrap();
        selection
            .set_style(
                &channel("a"),
                TraceStyle {
                    visible: false,
                    ..TraceStyle::default()
                },
            )
            .unwrap();
        selection.add(ChannelRef::new(DatasetId(2), "b"), "kPa".into()).unwrap();
        assert_eq!(selection.clear_dataset(DatasetId(1)), 1);
        assert_eq!(selection.clear_dataset(DatasetId(1)), 0);

        let events: Vec<SelectionEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].change, SelectionChange::Added(channel("a")));
        assert_eq!(events[1].change, SelectionChange::Style(channel("a")));
        assert_eq!(
            events[3].change,
            SelectionChange::DatasetCleared {
                dataset: DatasetId(1),
                removed: 1
            }
        );
        assert_eq!(events[3].revision, selection.revision());
        assert_eq!(selection.subscribers.len(), 1);
    }

    #[test]
    fn test_missing_entry() {
        let mut selection = Selection::default();
        assert!(matches!(
            selection.remove(&channel("nope")),
            Err(SelectionError::NotSelected(_))
        ));
        assert!(selection.set_display_unit(&channel("nope"), None).is_err());
    }
}
