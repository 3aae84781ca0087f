//! Authoritative world state for one room.
//!
//! The world is a square grid of tiles `0..=dimension` on both axes. It
//! holds the clients that have joined (with their positions) and a few
//! interactive items. Only the owning room server's loop mutates it.
//!
//! Mutations return the [`WorldDelta`]s they caused; the server turns
//! them into one `STATE_UPDATE` with [`WorldState::commit`], which also
//! advances the frame counter.
//!
//! # Rounds
//!
//! A round lasts one housekeeping tick. When the last use of an item is
//! taken, the tile is marked "emptied this round" so that anyone else who
//! reaches for it in the same round is told they were beaten to it
//! (`Contended`) rather than simply finding it `Empty`.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::Rng;
use roomgate_protocol::{
    Ack, ActionOutcome, ClientId, Direction, ItemKind, PlacedClient, PlacedItem, Position,
    RoomId, Side, StateUpdate, WorldDelta, WorldSnapshot,
};

use crate::RoomError;

/// Where the fixed chest lives.
pub const CHEST_POSITION: Position = Position::new(1, 1);

#[derive(Debug, Clone, Copy)]
struct Presence {
    position: Position,
    /// `false` after the client left; the position is kept so that a
    /// returning client lands where it was.
    present: bool,
}

#[derive(Debug, Clone, Copy)]
struct Item {
    kind: ItemKind,
    uses: u32,
}

/// The state of one room.
#[derive(Debug)]
pub struct WorldState {
    room_id: RoomId,
    dimension: i32,
    frame: u64,
    clients: HashMap<ClientId, Presence>,
    items: BTreeMap<Position, Item>,
    emptied_this_round: HashSet<Position>,
}

impl WorldState {
    /// A world without any items.
    pub fn empty(room_id: RoomId, dimension: i32) -> Self {
        Self {
            room_id,
            dimension,
            frame: 0,
            clients: HashMap::new(),
            items: BTreeMap::new(),
            emptied_this_round: HashSet::new(),
        }
    }

    /// A world with the fixed chest and one random item.
    ///
    /// The random item is a chest or a fire, placed on a tile that is
    /// neither the chest's tile nor the spawn point.
    pub fn generate(room_id: RoomId, dimension: i32, rng: &mut impl Rng) -> Self {
        let mut world = Self::empty(room_id, dimension);
        world.place_item(CHEST_POSITION, ItemKind::Chest);

        let centre = world.spawn_point();
        let free: Vec<Position> = (0..=dimension)
            .flat_map(|x| (0..=dimension).map(move |y| Position::new(x, y)))
            .filter(|p| *p != CHEST_POSITION && *p != centre)
            .collect();
        if !free.is_empty() {
            let position = free[rng.random_range(0..free.len())];
            let kind = if rng.random_bool(0.5) {
                ItemKind::Chest
            } else {
                ItemKind::Fire
            };
            world.place_item(position, kind);
        }
        world
    }

    /// Puts a fresh item on a tile, replacing whatever was there.
    pub fn place_item(&mut self, position: Position, kind: ItemKind) {
        self.items.insert(
            position,
            Item {
                kind,
                uses: kind.initial_uses(),
            },
        );
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn dimension(&self) -> i32 {
        self.dimension
    }

    /// The frame counter of the last committed update.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Where new clients appear.
    pub fn spawn_point(&self) -> Position {
        Position::new(self.dimension / 2, self.dimension / 2)
    }

    pub fn contains(&self, position: Position) -> bool {
        (0..=self.dimension).contains(&position.x) && (0..=self.dimension).contains(&position.y)
    }

    /// Number of clients currently in the room.
    pub fn present_count(&self) -> usize {
        self.clients.values().filter(|p| p.present).count()
    }

    pub fn is_present(&self, client: ClientId) -> bool {
        self.clients.get(&client).is_some_and(|p| p.present)
    }

    pub fn position_of(&self, client: ClientId) -> Option<Position> {
        self.clients
            .get(&client)
            .filter(|p| p.present)
            .map(|p| p.position)
    }

    /// The item on a tile and its remaining uses.
    pub fn item_at(&self, position: Position) -> Option<(ItemKind, u32)> {
        self.items.get(&position).map(|i| (i.kind, i.uses))
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Adds a client, restoring its previous position if it was here
    /// before. Returns `None` if the client is already present.
    pub fn add_client(&mut self, client: ClientId) -> Option<WorldDelta> {
        let spawn = self.spawn_point();
        let presence = self.clients.entry(client).or_insert(Presence {
            position: spawn,
            present: false,
        });
        if presence.present {
            return None;
        }
        presence.present = true;
        Some(WorldDelta::ClientJoined {
            client_id: client,
            position: presence.position,
        })
    }

    /// Marks a client as gone. Returns `None` if it was not present.
    pub fn remove_client(&mut self, client: ClientId) -> Option<WorldDelta> {
        let presence = self.clients.get_mut(&client).filter(|p| p.present)?;
        presence.present = false;
        Some(WorldDelta::ClientLeft { client_id: client })
    }

    // -----------------------------------------------------------------------
    // Gameplay
    // -----------------------------------------------------------------------

    /// Moves a client one tile, clamped to the grid.
    ///
    /// Walking into the left or right wall reports which side was hit,
    /// so the client can go to a neighbouring room.
    pub fn apply_move(
        &mut self,
        client: ClientId,
        direction: Direction,
    ) -> Result<(Ack, Vec<WorldDelta>), RoomError> {
        let dimension = self.dimension;
        let presence = self
            .clients
            .get_mut(&client)
            .filter(|p| p.present)
            .ok_or(RoomError::NotJoined(client))?;

        let (dx, dy) = direction.offset();
        let from = presence.position;
        let wanted = Position::new(from.x + dx, from.y + dy);
        let to = Position::new(wanted.x.clamp(0, dimension), wanted.y.clamp(0, dimension));

        let exit = if wanted.x < 0 {
            Some(Side::Left)
        } else if wanted.x > dimension {
            Some(Side::Right)
        } else {
            None
        };

        let mut changes = Vec::new();
        if to != from {
            presence.position = to;
            changes.push(WorldDelta::ClientMoved {
                client_id: client,
                position: to,
            });
        }
        Ok((Ack::Moved { position: to, exit }, changes))
    }

    /// Interacts with a tile next to (or under) the client.
    pub fn apply_action(
        &mut self,
        client: ClientId,
        target: Position,
    ) -> Result<(Ack, Vec<WorldDelta>), RoomError> {
        let from = self
            .position_of(client)
            .ok_or(RoomError::NotJoined(client))?;
        if !self.contains(target) {
            return Err(RoomError::OutOfBounds(target));
        }
        if from.distance(target) > 1 {
            return Err(RoomError::OutOfReach { from, target });
        }

        let mut changes = Vec::new();
        let outcome = match self.items.get_mut(&target) {
            Some(item) if item.uses == 0 => {
                if self.emptied_this_round.contains(&target) {
                    ActionOutcome::Contended { item: item.kind }
                } else {
                    ActionOutcome::Empty { item: item.kind }
                }
            }
            Some(item) => {
                item.uses -= 1;
                if item.uses == 0 {
                    self.emptied_this_round.insert(target);
                }
                changes.push(WorldDelta::ItemChanged {
                    position: target,
                    item: item.kind,
                    uses: item.uses,
                });
                ActionOutcome::Used {
                    item: item.kind,
                    remaining: item.uses,
                }
            }
            None => {
                let mut others: Vec<ClientId> = self
                    .clients
                    .iter()
                    .filter(|(id, p)| **id != client && p.present && p.position == target)
                    .map(|(id, _)| *id)
                    .collect();
                if others.is_empty() {
                    ActionOutcome::Nothing
                } else {
                    others.sort();
                    ActionOutcome::Bumped { clients: others }
                }
            }
        };
        Ok((Ack::Acted { outcome }, changes))
    }

    /// Ends the current round.
    pub fn end_round(&mut self) {
        self.emptied_this_round.clear();
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Turns deltas into the next `STATE_UPDATE`, advancing the frame.
    /// Returns `None` (and leaves the frame alone) if nothing changed.
    pub fn commit(&mut self, changes: Vec<WorldDelta>) -> Option<StateUpdate> {
        if changes.is_empty() {
            return None;
        }
        self.frame += 1;
        Some(StateUpdate {
            room_id: self.room_id.clone(),
            frame: self.frame,
            changes,
        })
    }

    /// The full current state.
    pub fn snapshot(&self) -> WorldSnapshot {
        let mut clients: Vec<PlacedClient> = self
            .clients
            .iter()
            .filter(|(_, p)| p.present)
            .map(|(id, p)| PlacedClient {
                client_id: *id,
                position: p.position,
            })
            .collect();
        clients.sort_by_key(|c| c.client_id);

        WorldSnapshot {
            room_id: self.room_id.clone(),
            dimension: self.dimension,
            frame: self.frame,
            clients,
            items: self
                .items
                .iter()
                .map(|(position, item)| PlacedItem {
                    position: *position,
                    item: item.kind,
                    uses: item.uses,
                })
                .collect(),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
