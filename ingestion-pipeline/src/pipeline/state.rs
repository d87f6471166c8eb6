use state_machines::state_machine;

state_machine! {
    name: ProcessingMachine,
    state: ProcessingState,
    initial: Ready,
    states: [Ready, Parsed, Embedded, Indexed, Failed],
    events {
        parse { transition: { from: Ready, to: Parsed } }
        embed { transition: { from: Parsed, to: Embedded } }
        index { transition: { from: Embedded, to: Indexed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Parsed, to: Failed }
            transition: { from: Embedded, to: Failed }
        }
    }
}

pub fn ready() -> ProcessingMachine<(), Ready> {
    ProcessingMachine::new(())
}

/// Entry point for resuming after external transcription: the parse stage
/// already happened outside the process.
pub fn parsed() -> ProcessingMachine<(), Parsed> {
    ready()
        .parse()
        .expect("parse transition from Ready should exist")
}
