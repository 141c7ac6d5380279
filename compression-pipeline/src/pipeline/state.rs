use state_machines::state_machine;

state_machine! {
    name: CompressionMachine,
    state: CompressionState,
    initial: Ready,
    states: [Ready, Started, Compressed, Stored, Completed, Failed],
    events {
        start { transition: { from: Ready, to: Started } }
        compress { transition: { from: Started, to: Compressed } }
        store { transition: { from: Compressed, to: Stored } }
        complete { transition: { from: Stored, to: Completed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Started, to: Failed }
            transition: { from: Compressed, to: Failed }
            transition: { from: Stored, to: Failed }
        }
    }
}

pub fn ready() -> CompressionMachine<(), Ready> {
    CompressionMachine::new(())
}
