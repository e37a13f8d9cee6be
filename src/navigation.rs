use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionState {
    Unvisited,
    Detecting,
    Detected,
}

/// Permission to run one detection pass for `page_index`. The result must
/// be applied to that page no matter which page is shown by then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionTicket {
    pub page_index: usize,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionTracker {
    states: Vec<DetectionState>,
    generations: Vec<u64>,
}

impl DetectionTracker {
    pub fn new(page_count: usize) -> Self {
        Self {
            states: vec![DetectionState::Unvisited; page_count],
            generations: vec![0; page_count],
        }
    }

    pub fn page_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, page_index: usize) -> Option<DetectionState> {
        self.states.get(page_index).copied()
    }

    /// First view of a page. Starts detection only for an unvisited page
    /// that has no fields yet.
    pub fn on_show(&mut self, page_index: usize, field_count: usize) -> Option<DetectionTicket> {
        match self.state(page_index)? {
            DetectionState::Unvisited if field_count == 0 => self.start(page_index),
            DetectionState::Unvisited => {
                self.states[page_index] = DetectionState::Detected;
                None
            }
            DetectionState::Detecting | DetectionState::Detected => None,
        }
    }

    /// Manual re-scan. Refused only while the page already has a pass in flight.
    pub fn on_rescan(&mut self, page_index: usize) -> Option<DetectionTicket> {
        match self.state(page_index)? {
            DetectionState::Detecting => None,
            DetectionState::Unvisited | DetectionState::Detected => self.start(page_index),
        }
    }

    /// Marks the ticket's page as detected. Returns `false` for a ticket
    /// that is not the one currently in flight for its page.
    pub fn finish(&mut self, ticket: DetectionTicket) -> bool {
        let page = ticket.page_index;
        let current = self.generations.get(page).copied();
        if current != Some(ticket.generation) || self.states[page] != DetectionState::Detecting {
            return false;
        }
        self.states[page] = DetectionState::Detected;
        true
    }

    fn start(&mut self, page_index: usize) -> Option<DetectionTicket> {
        self.states[page_index] = DetectionState::Detecting;
        self.generations[page_index] += 1;
        Some(DetectionTicket {
            page_index,
            generation: self.generations[page_index],
        })
    }
}
