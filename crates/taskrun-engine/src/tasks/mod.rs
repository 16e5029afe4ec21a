//! Built-in task definitions.

pub mod mock_data;

pub use mock_data::{
    EntryWriter, InMemoryEntryWriter, MockDataCreator, MockDataInput, MockDataOutput,
    MOCK_DATA_CREATOR,
};
